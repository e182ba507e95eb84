pub mod checkpoint;
pub mod data_loader;
pub mod distributed;
pub mod ema;
pub mod epoch;
pub mod gradient_accumulator;
pub mod lr_scheduler;
pub mod noise_scheduler;
pub mod optimizer;
pub mod orchestrator;
pub mod sampling;
pub mod setup;
pub mod tracker;

// Re-export key types
pub use checkpoint::{CheckpointManager, ResumePlan, ResumeTarget};
pub use orchestrator::{launch, RunSummary};
pub use setup::TrainingSetup;

use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete, validated description of a fine-tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_job")]
    pub job: String,
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub noise_scheduler: NoiseSchedulerConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub lr_scheduler: LrSchedulerConfig,
    #[serde(default)]
    pub ema: EmaConfig,
    pub save: SaveConfig,
    #[serde(default)]
    pub sample: SampleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory holding a diffusers-layout pretrained pipeline
    pub pretrained_path: PathBuf,
    #[serde(default)]
    pub learn_denoiser_from_scratch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub root: PathBuf,
    #[serde(default = "default_resolution")]
    pub resolution: usize,
    /// Caption built from the class name, `{class}` is substituted
    #[serde(default = "default_caption_template")]
    pub caption_template: String,
    #[serde(default)]
    pub caption_dropout_rate: f32,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Image decoding threads, defaults to the number of CPUs
    #[serde(default)]
    pub num_workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub num_epochs: usize,
    pub gradient_accumulation_steps: usize,
    pub mixed_precision: MixedPrecision,
    pub seed: u64,
    pub max_grad_norm: Option<f32>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            num_epochs: 100,
            gradient_accumulation_steps: 1,
            mixed_precision: MixedPrecision::No,
            seed: 42,
            max_grad_norm: Some(1.0),
        }
    }
}

/// Precision of the frozen components.
///
/// Only the autoencoder and the text encoder are stored and run in the
/// reduced dtype, and their outputs are cast back to f32. The denoiser keeps
/// f32 weights and runs its forward and backward passes in f32 under every
/// setting: this saves memory on the frozen path without touching the
/// trainable one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MixedPrecision {
    No,
    Fp16,
    Bf16,
}

impl MixedPrecision {
    /// Dtype of the frozen components.
    pub fn weight_dtype(&self) -> DType {
        match self {
            MixedPrecision::No => DType::F32,
            MixedPrecision::Fp16 => DType::F16,
            MixedPrecision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
}

impl Default for NoiseSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_weight_decay: f64,
    pub adam_epsilon: f64,
    pub use_8bit_adam: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_weight_decay: 1e-2,
            adam_epsilon: 1e-8,
            use_8bit_adam: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduleKind {
    Constant,
    ConstantWithWarmup,
    Linear,
    Cosine,
    CosineWithRestarts,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LrSchedulerConfig {
    #[serde(rename = "type")]
    pub kind: LrScheduleKind,
    pub warmup_steps: usize,
    pub num_cycles: usize,
    pub power: f64,
    pub lr_end: f64,
}

impl Default for LrSchedulerConfig {
    fn default() -> Self {
        Self {
            kind: LrScheduleKind::Cosine,
            warmup_steps: 500,
            num_cycles: 1,
            power: 1.0,
            lr_end: 1e-7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    pub enabled: bool,
    pub max_decay: f64,
    pub min_decay: f64,
    pub inv_gamma: f64,
    pub power: f64,
    pub update_after_step: usize,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_decay: 0.9999,
            min_decay: 0.0,
            inv_gamma: 1.0,
            power: 0.75,
            update_after_step: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    pub output_dir: PathBuf,
    #[serde(default = "default_every_epochs")]
    pub save_model_epochs: usize,
    #[serde(default)]
    pub checkpoints_total_limit: Option<usize>,
    /// `latest`, a checkpoint directory name, or a path to one
    #[serde(default)]
    pub resume_from_checkpoint: Option<String>,
    /// Start fresh instead of failing when the resume target is missing
    #[serde(default)]
    pub allow_missing_checkpoint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    pub save_images_epochs: usize,
    pub nb_generated_images: usize,
    pub eval_batch_size: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            save_images_epochs: 10,
            nb_generated_images: 16,
            eval_batch_size: 4,
            num_inference_steps: 50,
            guidance_scale: 7.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    Jsonl,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub tracker: TrackerKind,
    pub log_every_n_steps: usize,
    pub project_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerKind::Jsonl,
            log_every_n_steps: 1,
            project_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// One data-parallel replica per entry: `auto`, `cpu`, `cuda:N`, `metal:N`
    pub devices: Vec<String>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            devices: vec!["auto".to_string()],
        }
    }
}

/// Command line overrides applied on top of the YAML file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub output_dir: Option<PathBuf>,
    pub resume_from_checkpoint: Option<String>,
    pub num_epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub learning_rate: Option<f64>,
    pub mixed_precision: Option<MixedPrecision>,
}

impl RunConfig {
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(dir) = &overrides.output_dir {
            self.save.output_dir = dir.clone();
        }
        if let Some(target) = &overrides.resume_from_checkpoint {
            self.save.resume_from_checkpoint = Some(target.clone());
        }
        if let Some(epochs) = overrides.num_epochs {
            self.train.num_epochs = epochs;
        }
        if let Some(batch_size) = overrides.batch_size {
            self.train.batch_size = batch_size;
        }
        if let Some(lr) = overrides.learning_rate {
            self.optimizer.learning_rate = lr;
        }
        if let Some(precision) = overrides.mixed_precision {
            self.train.mixed_precision = precision;
        }
    }

    /// Number of data-parallel replicas.
    pub fn world_size(&self) -> usize {
        self.distributed.devices.len()
    }

    /// Tracker project name, defaults to the output directory name.
    pub fn project_name(&self) -> String {
        if let Some(name) = &self.logging.project_name {
            return name.clone();
        }
        let dir = &self.save.output_dir;
        let stripped = dir.strip_prefix("experiments").unwrap_or(dir);
        let name = stripped.to_string_lossy().trim_matches('/').to_string();
        if name.is_empty() {
            "latent-tuner".to_string()
        } else {
            name
        }
    }

    /// Check every option and report all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.train.batch_size == 0 {
            errors.push("train.batch_size must be greater than 0".to_string());
        }
        if self.train.num_epochs == 0 {
            errors.push("train.num_epochs must be greater than 0".to_string());
        }
        if self.train.gradient_accumulation_steps == 0 {
            errors.push("train.gradient_accumulation_steps must be greater than 0".to_string());
        }
        if let Some(norm) = self.train.max_grad_norm {
            if norm <= 0.0 {
                errors.push("train.max_grad_norm must be greater than 0".to_string());
            }
        }
        if self.dataset.resolution == 0 || self.dataset.resolution % 8 != 0 {
            errors.push("dataset.resolution must be a positive multiple of 8".to_string());
        }
        if !(0.0..=1.0).contains(&self.dataset.caption_dropout_rate) {
            errors.push("dataset.caption_dropout_rate must be in [0, 1]".to_string());
        }

        let ns = &self.noise_scheduler;
        if ns.num_train_timesteps < 2 {
            errors.push("noise_scheduler.num_train_timesteps must be at least 2".to_string());
        }
        if !(ns.beta_start > 0.0 && ns.beta_start < ns.beta_end && ns.beta_end < 1.0) {
            errors.push("noise_scheduler betas must satisfy 0 < beta_start < beta_end < 1".to_string());
        }

        let opt = &self.optimizer;
        if opt.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if !(0.0 < opt.adam_beta1 && opt.adam_beta1 < 1.0) {
            errors.push("optimizer.adam_beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < opt.adam_beta2 && opt.adam_beta2 < 1.0) {
            errors.push("optimizer.adam_beta2 must be in (0, 1)".to_string());
        }
        if opt.adam_weight_decay < 0.0 {
            errors.push("optimizer.adam_weight_decay must be >= 0".to_string());
        }
        if opt.adam_epsilon <= 0.0 {
            errors.push("optimizer.adam_epsilon must be greater than 0".to_string());
        }

        if self.lr_scheduler.kind == LrScheduleKind::CosineWithRestarts && self.lr_scheduler.num_cycles == 0 {
            errors.push("lr_scheduler.num_cycles must be greater than 0".to_string());
        }
        if self.lr_scheduler.kind == LrScheduleKind::Polynomial && self.lr_scheduler.lr_end >= opt.learning_rate {
            errors.push("lr_scheduler.lr_end must be lower than optimizer.learning_rate".to_string());
        }

        if self.ema.enabled {
            if !(0.0..=1.0).contains(&self.ema.max_decay) || self.ema.min_decay > self.ema.max_decay {
                errors.push("ema decays must satisfy 0 <= min_decay <= max_decay <= 1".to_string());
            }
            if self.ema.inv_gamma <= 0.0 {
                errors.push("ema.inv_gamma must be greater than 0".to_string());
            }
        }

        if self.save.save_model_epochs == 0 {
            errors.push("save.save_model_epochs must be greater than 0".to_string());
        }
        if let Some(0) = self.save.checkpoints_total_limit {
            errors.push("save.checkpoints_total_limit must be greater than 0".to_string());
        }
        if let Some(target) = &self.save.resume_from_checkpoint {
            if target.trim().is_empty() {
                errors.push("save.resume_from_checkpoint must not be empty".to_string());
            }
        }

        let sample = &self.sample;
        if sample.save_images_epochs == 0 {
            errors.push("sample.save_images_epochs must be greater than 0".to_string());
        }
        if sample.nb_generated_images == 0 {
            errors.push("sample.nb_generated_images must be greater than 0".to_string());
        }
        if sample.eval_batch_size == 0 {
            errors.push("sample.eval_batch_size must be greater than 0".to_string());
        }
        if sample.num_inference_steps == 0 || sample.num_inference_steps > ns.num_train_timesteps {
            errors.push("sample.num_inference_steps must be in [1, num_train_timesteps]".to_string());
        }
        if sample.guidance_scale < 0.0 {
            errors.push("sample.guidance_scale must be >= 0".to_string());
        }

        if self.logging.log_every_n_steps == 0 {
            errors.push("logging.log_every_n_steps must be greater than 0".to_string());
        }
        if self.distributed.devices.is_empty() {
            errors.push("distributed.devices must list at least one device".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(errors.join("; ")))
        }
    }

    /// Write the effective configuration next to the run outputs.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let config_str = fs::read_to_string(path)
        .map_err(|e| Error::resource(format!("config file {}", path.display()), e))?;

    let config: RunConfig = serde_yaml::from_str(&config_str)
        .map_err(|e| Error::configuration(format!("failed to parse {}: {e}", path.display())))?;

    Ok(config)
}

fn default_job() -> String {
    "finetune".to_string()
}

fn default_resolution() -> usize {
    512
}

fn default_caption_template() -> String {
    "{class}".to_string()
}

fn default_true() -> bool {
    true
}

fn default_every_epochs() -> usize {
    10
}
