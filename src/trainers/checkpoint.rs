//! Checkpoint persistence, retention and resume
//!
//! Layout under the output directory:
//!
//! ```text
//! checkpoints/checkpoint-<global_step>/
//!     denoiser.safetensors
//!     ema_denoiser.safetensors     (EMA runs only)
//!     optimizer.safetensors
//!     training_state.json
//! full_pipeline_save/              (latest standalone pipeline)
//! ```
//!
//! Records are assembled in a hidden temporary directory next to their final
//! location and published with a single rename, so a listing never returns a
//! half-written checkpoint.

use candle_core::{DType, Tensor, Var};
use log::{info, warn};
use safetensors::{serialize, tensor::TensorView, Dtype as SafeDtype};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::ema::EmaModel;
use super::lr_scheduler::{LrScheduler, SchedulerState};
use super::optimizer::AdamW;
use crate::error::{Error, Result};
use crate::loaders::{ComponentSource, SourceMetadata};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
const TEMP_PREFIX: &str = ".tmp-checkpoint-";
const DENOISER_FILENAME: &str = "denoiser.safetensors";
const EMA_FILENAME: &str = "ema_denoiser.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.safetensors";
const STATE_FILENAME: &str = "training_state.json";
const PIPELINE_DIRNAME: &str = "full_pipeline_save";

/// Progress counters of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrainingState {
    pub global_step: usize,
    /// Last completed epoch
    pub epoch: usize,
    /// Updates already taken inside the epoch after `epoch`
    pub resume_step: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmaState {
    pub optimization_step: usize,
}

/// Content of `training_state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub global_step: usize,
    pub epoch: usize,
    pub resume_step: usize,
    pub scheduler: SchedulerState,
    pub optimizer_step: usize,
    pub ema: Option<EmaState>,
    pub pretrained: SourceMetadata,
    pub created_at: String,
}

impl CheckpointManifest {
    pub fn training_state(&self) -> TrainingState {
        TrainingState {
            global_step: self.global_step,
            epoch: self.epoch,
            resume_step: self.resume_step,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

impl CheckpointRecord {
    pub fn name(&self) -> String {
        self.directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Which checkpoint to resume from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeTarget {
    Latest,
    /// A checkpoint directory name or a path to one
    Named(String),
}

impl ResumeTarget {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "latest" => ResumeTarget::Latest,
            other => ResumeTarget::Named(other.to_string()),
        }
    }
}

/// Where the epoch loop picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumePlan {
    pub global_step: usize,
    pub first_epoch: usize,
    pub resume_step: usize,
    /// Micro-batches of `first_epoch` that were already consumed
    pub skip_batches: usize,
}

impl ResumePlan {
    pub fn fresh() -> Self {
        Self::default()
    }

    pub fn from_global_step(global_step: usize, num_update_steps_per_epoch: usize, gradient_accumulation_steps: usize) -> Self {
        let steps = num_update_steps_per_epoch.max(1);
        let resume_step = global_step % steps;
        Self {
            global_step,
            first_epoch: global_step / steps,
            resume_step,
            skip_batches: resume_step * gradient_accumulation_steps,
        }
    }

    pub fn is_resumed(&self) -> bool {
        self.global_step > 0
    }
}

/// Everything needed to write one record.
pub struct SaveRequest<'a> {
    pub state: TrainingState,
    pub params: &'a [(String, Var)],
    pub ema: Option<&'a EmaModel>,
    pub optimizer: &'a AdamW,
    pub scheduler: &'a LrScheduler,
    pub pretrained: SourceMetadata,
}

/// Mutable training state restored from a record.
pub struct RestoreTarget<'a> {
    pub params: &'a [(String, Var)],
    pub ema: Option<&'a mut EmaModel>,
    pub optimizer: &'a mut AdamW,
    pub scheduler: &'a mut LrScheduler,
}

pub struct CheckpointManager {
    output_dir: PathBuf,
    checkpoints_dir: PathBuf,
    total_limit: Option<usize>,
}

impl CheckpointManager {
    pub fn new(output_dir: &Path, total_limit: Option<usize>) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            checkpoints_dir: output_dir.join("checkpoints"),
            total_limit,
        }
    }

    pub fn checkpoints_dir(&self) -> &Path {
        &self.checkpoints_dir
    }

    pub fn pipeline_dir(&self) -> PathBuf {
        self.output_dir.join(PIPELINE_DIRNAME)
    }

    /// Published records, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointRecord>> {
        let mut records = Vec::new();
        if !self.checkpoints_dir.exists() {
            return Ok(records);
        }
        for entry in fs::read_dir(&self.checkpoints_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if parse_step(&name).is_none() {
                continue;
            }
            match read_manifest(&entry.path()) {
                Ok(manifest) => records.push(CheckpointRecord {
                    directory: entry.path(),
                    manifest,
                }),
                Err(err) => warn!("Ignoring unreadable checkpoint {name}: {err}"),
            }
        }
        records.sort_by_key(|r| r.manifest.global_step);
        Ok(records)
    }

    pub fn latest(&self) -> Result<Option<CheckpointRecord>> {
        Ok(self.list()?.pop())
    }

    pub fn find(&self, target: &ResumeTarget) -> Result<Option<CheckpointRecord>> {
        match target {
            ResumeTarget::Latest => self.latest(),
            ResumeTarget::Named(name) => {
                let as_path = PathBuf::from(name);
                let directory = if as_path.is_absolute() || as_path.components().count() > 1 {
                    as_path
                } else {
                    self.checkpoints_dir.join(name)
                };
                if !directory.join(STATE_FILENAME).is_file() {
                    return Ok(None);
                }
                let manifest = read_manifest(&directory)?;
                Ok(Some(CheckpointRecord { directory, manifest }))
            }
        }
    }

    /// Locate the resume target. A missing target is fatal unless `allow_missing`.
    pub fn resolve(&self, target: &ResumeTarget, allow_missing: bool) -> Result<Option<CheckpointRecord>> {
        match self.find(target)? {
            Some(record) => Ok(Some(record)),
            None if allow_missing => {
                warn!("Checkpoint {target:?} does not exist, starting a new training run");
                Ok(None)
            }
            None => Err(Error::CheckpointNotFound(match target {
                ResumeTarget::Latest => format!("no checkpoint in {}", self.checkpoints_dir.display()),
                ResumeTarget::Named(name) => name.clone(),
            })),
        }
    }

    /// Write and publish a record, then apply the retention limit.
    pub fn save(&self, request: SaveRequest<'_>) -> Result<CheckpointRecord> {
        fs::create_dir_all(&self.checkpoints_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(&self.checkpoints_dir)?;

        let step = request.state.global_step;
        let mut metadata = HashMap::new();
        metadata.insert("global_step".to_string(), step.to_string());

        let weights: HashMap<String, Tensor> = request
            .params
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        if weights.is_empty() {
            return Err(Error::checkpoint("denoiser has no parameters to checkpoint"));
        }
        write_safetensors(&staging.path().join(DENOISER_FILENAME), &weights, metadata.clone())?;

        if let Some(ema) = request.ema {
            let mut ema_metadata = metadata.clone();
            ema_metadata.insert("optimization_step".to_string(), ema.optimization_step().to_string());
            write_safetensors(&staging.path().join(EMA_FILENAME), &ema.state_tensors(), ema_metadata)?;
        }

        let mut opt_metadata = metadata;
        opt_metadata.insert("optimizer_step".to_string(), request.optimizer.step_count().to_string());
        opt_metadata.insert("learning_rate".to_string(), request.scheduler.last_lr().to_string());
        write_safetensors(
            &staging.path().join(OPTIMIZER_FILENAME),
            &request.optimizer.state_tensors()?,
            opt_metadata,
        )?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            global_step: step,
            epoch: request.state.epoch,
            resume_step: request.state.resume_step,
            scheduler: request.scheduler.state(),
            optimizer_step: request.optimizer.step_count(),
            ema: request.ema.map(|e| EmaState {
                optimization_step: e.optimization_step(),
            }),
            pretrained: request.pretrained,
            created_at: chrono::Local::now().to_rfc3339(),
        };
        fs::write(staging.path().join(STATE_FILENAME), serde_json::to_string_pretty(&manifest)?)?;

        let directory = self.checkpoints_dir.join(format!("{CHECKPOINT_PREFIX}{step}"));
        // The replaced record stays on disk until the new one is published
        let previous = self.checkpoints_dir.join(format!(".{CHECKPOINT_PREFIX}{step}.old"));
        if previous.exists() {
            fs::remove_dir_all(&previous)?;
        }
        if directory.exists() {
            warn!("Replacing existing checkpoint {}", directory.display());
            fs::rename(&directory, &previous)?;
        }
        let staged = staging.into_path();
        if let Err(err) = fs::rename(&staged, &directory) {
            let _ = fs::remove_dir_all(&staged);
            if previous.exists() {
                let _ = fs::rename(&previous, &directory);
            }
            return Err(err.into());
        }
        if previous.exists() {
            fs::remove_dir_all(&previous)?;
        }
        info!("Saved state to {}", directory.display());

        self.prune()?;
        Ok(CheckpointRecord { directory, manifest })
    }

    /// Delete the oldest records beyond the retention limit.
    pub fn prune(&self) -> Result<Vec<PathBuf>> {
        let Some(limit) = self.total_limit else {
            return Ok(Vec::new());
        };
        let records = self.list()?;
        if records.len() <= limit {
            return Ok(Vec::new());
        }
        let excess = records.len() - limit;
        info!(
            "{} checkpoints already exist, removing {excess} checkpoints",
            records.len()
        );
        let mut removed = Vec::with_capacity(excess);
        for record in records.into_iter().take(excess) {
            info!("Removing checkpoint {}", record.directory.display());
            fs::remove_dir_all(&record.directory)?;
            removed.push(record.directory);
        }
        Ok(removed)
    }

    /// Export a standalone pipeline, replacing the previous export.
    pub fn export_pipeline(&self, source: &dyn ComponentSource, denoiser_weights: &HashMap<String, Tensor>) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".tmp-pipeline-")
            .tempdir_in(&self.output_dir)?;
        source.export_pipeline(staging.path(), denoiser_weights)?;

        let target = self.pipeline_dir();
        let previous = self.output_dir.join(format!(".{PIPELINE_DIRNAME}.old"));
        if previous.exists() {
            fs::remove_dir_all(&previous)?;
        }
        if target.exists() {
            fs::rename(&target, &previous)?;
        }
        let staged = staging.into_path();
        if let Err(err) = fs::rename(&staged, &target) {
            let _ = fs::remove_dir_all(&staged);
            if previous.exists() {
                let _ = fs::rename(&previous, &target);
            }
            return Err(err.into());
        }
        if previous.exists() {
            fs::remove_dir_all(&previous)?;
        }
        info!("Exported pipeline to {}", target.display());
        Ok(target)
    }

    /// Load a record into the live training state, in place.
    pub fn restore(&self, record: &CheckpointRecord, target: RestoreTarget<'_>) -> Result<TrainingState> {
        let manifest = &record.manifest;
        if manifest.version != CHECKPOINT_VERSION {
            return Err(Error::checkpoint(format!(
                "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
                manifest.version
            )));
        }
        let Some((_, first)) = target.params.first() else {
            return Err(Error::checkpoint("denoiser has no parameters to restore"));
        };
        let device = first.device().clone();

        let weights = candle_core::safetensors::load(record.directory.join(DENOISER_FILENAME), &device)?;
        apply_weights(target.params, weights)?;

        match (target.ema, &manifest.ema) {
            (Some(ema), Some(state)) => {
                let shadow = candle_core::safetensors::load(record.directory.join(EMA_FILENAME), &device)?;
                ema.load_state_tensors(shadow, state.optimization_step)?;
            }
            (Some(_), None) => {
                return Err(Error::checkpoint(format!(
                    "{} has no EMA weights but EMA is enabled",
                    record.name()
                )));
            }
            (None, Some(_)) => info!("Ignoring EMA weights in {}, EMA is disabled", record.name()),
            (None, None) => {}
        }

        let moments = candle_core::safetensors::load(record.directory.join(OPTIMIZER_FILENAME), &device)?;
        target.optimizer.load_state_tensors(moments, manifest.optimizer_step)?;
        target.scheduler.load_state(manifest.scheduler);

        info!("Resumed from checkpoint {}", record.directory.display());
        Ok(manifest.training_state())
    }
}

fn parse_step(name: &str) -> Option<usize> {
    name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
}

fn read_manifest(directory: &Path) -> Result<CheckpointManifest> {
    let content = fs::read_to_string(directory.join(STATE_FILENAME))?;
    Ok(serde_json::from_str(&content)?)
}

/// Overwrite every parameter from `weights`; the name sets must match exactly.
pub fn apply_weights(params: &[(String, Var)], mut weights: HashMap<String, Tensor>) -> Result<()> {
    for (name, var) in params {
        let tensor = weights
            .remove(name)
            .ok_or_else(|| Error::checkpoint(format!("checkpoint missing parameter {name}")))?;
        if tensor.dims() != var.dims() {
            return Err(Error::checkpoint(format!(
                "parameter {name} has shape {:?} in checkpoint, {:?} in model",
                tensor.dims(),
                var.dims()
            )));
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    if !weights.is_empty() {
        let mut extra: Vec<_> = weights.into_keys().collect();
        extra.sort();
        return Err(Error::checkpoint(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

/// Serialize tensors with string metadata.
pub fn write_safetensors(path: &Path, tensors: &HashMap<String, Tensor>, metadata: HashMap<String, String>) -> Result<()> {
    let mut tensor_data = Vec::with_capacity(tensors.len());
    let mut tensor_info = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        tensor_info.push((name.clone(), convert_dtype(tensor.dtype())?, tensor.dims().to_vec(), tensor_data.len()));
        tensor_data.push(tensor_to_vec(tensor)?);
    }

    let mut views = HashMap::with_capacity(tensor_info.len());
    for (name, dtype, shape, idx) in tensor_info {
        views.insert(name, TensorView::new(dtype, shape, &tensor_data[idx])?);
    }

    let data = serialize(&views, &Some(metadata))?;
    fs::write(path, data)?;
    Ok(())
}

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        DType::F64 => Ok(SafeDtype::F64),
        DType::U8 => Ok(SafeDtype::U8),
        other => Err(Error::checkpoint(format!("unsupported dtype for safetensors: {other:?}"))),
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?;
    let data = match tensor.dtype() {
        DType::F32 => flattened.to_vec1::<f32>()?.into_iter().flat_map(|f| f.to_le_bytes()).collect(),
        DType::F16 => flattened.to_vec1::<half::f16>()?.into_iter().flat_map(|f| f.to_le_bytes()).collect(),
        DType::BF16 => flattened.to_vec1::<half::bf16>()?.into_iter().flat_map(|f| f.to_le_bytes()).collect(),
        DType::F64 => flattened.to_vec1::<f64>()?.into_iter().flat_map(|f| f.to_le_bytes()).collect(),
        DType::U8 => flattened.to_vec1::<u8>()?,
        other => return Err(Error::checkpoint(format!("unsupported dtype for safetensors: {other:?}"))),
    };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_plan_splits_global_step() {
        let plan = ResumePlan::from_global_step(15, 5, 1);
        assert_eq!((plan.first_epoch, plan.resume_step, plan.skip_batches), (3, 0, 0));

        let plan = ResumePlan::from_global_step(7, 3, 2);
        assert_eq!((plan.first_epoch, plan.resume_step, plan.skip_batches), (2, 1, 2));
        assert!(plan.is_resumed());
        assert!(!ResumePlan::fresh().is_resumed());
    }

    #[test]
    fn resume_target_parsing() {
        assert_eq!(ResumeTarget::parse("latest"), ResumeTarget::Latest);
        assert_eq!(ResumeTarget::parse("checkpoint-30"), ResumeTarget::Named("checkpoint-30".into()));
    }

    #[test]
    fn only_numbered_directories_are_checkpoints() {
        assert_eq!(parse_step("checkpoint-120"), Some(120));
        assert_eq!(parse_step("checkpoint-final"), None);
        assert_eq!(parse_step(".tmp-checkpoint-abc"), None);
    }

    #[test]
    fn missing_target_is_fatal_unless_allowed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = CheckpointManager::new(dir.path(), Some(2));
        let err = manager.resolve(&ResumeTarget::Latest, false).unwrap_err();
        assert!(matches!(err, Error::CheckpointNotFound(_)));
        assert!(err.is_fatal());
        assert!(manager.resolve(&ResumeTarget::Named("checkpoint-9".into()), true)?.is_none());
        Ok(())
    }

    #[test]
    fn weights_must_match_parameter_set() -> Result<()> {
        let var = Var::new(&[1f32, 2.], &candle_core::Device::Cpu)?;
        let params = vec![("a".to_string(), var.clone())];
        let extra = HashMap::from([
            ("a".to_string(), Tensor::new(&[5f32, 6.], &candle_core::Device::Cpu)?),
            ("b".to_string(), Tensor::new(&[0f32], &candle_core::Device::Cpu)?),
        ]);
        assert!(matches!(apply_weights(&params, extra), Err(Error::Checkpoint(_))));
        assert!(apply_weights(&params, HashMap::new()).is_err());

        let exact = HashMap::from([("a".to_string(), Tensor::new(&[5f32, 6.], &candle_core::Device::Cpu)?)]);
        apply_weights(&params, exact)?;
        assert_eq!(var.as_tensor().to_vec1::<f32>()?, vec![5.0, 6.0]);
        Ok(())
    }

    #[test]
    fn safetensors_round_trip_keeps_values() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("w.safetensors");
        let device = candle_core::Device::Cpu;
        let tensors = HashMap::from([
            ("x".to_string(), Tensor::new(&[[1.5f32, -2.0], [0.25, 8.0]], &device)?),
            ("q".to_string(), Tensor::new(&[1u8, 200], &device)?),
        ]);
        write_safetensors(&path, &tensors, HashMap::new())?;
        let loaded = candle_core::safetensors::load(&path, &device)?;
        assert_eq!(loaded["x"].to_vec2::<f32>()?, vec![vec![1.5, -2.0], vec![0.25, 8.0]]);
        assert_eq!(loaded["q"].to_vec1::<u8>()?, vec![1, 200]);
        Ok(())
    }
}
