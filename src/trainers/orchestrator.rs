//! Run orchestration: one worker per data-parallel replica
//!
//! Every worker runs the same loop in lockstep:
//! train epoch, maybe generate samples, maybe checkpoint, barrier.

use candle_core::Device;
use log::{info, warn};
use rand::{rngs::StdRng, SeedableRng};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use super::checkpoint::{CheckpointManager, RestoreTarget, ResumePlan, ResumeTarget, SaveRequest, TrainingState};
use super::data_loader::{DataLoader, Dataset, EpochSampler};
use super::distributed::{parse_device, LocalGroup, ProcessGroup, SingleProcess};
use super::ema::EmaModel;
use super::epoch::{EpochDriver, Trainables};
use super::lr_scheduler::LrScheduler;
use super::noise_scheduler::NoiseScheduler;
use super::optimizer::AdamW;
use super::sampling::{report_metrics, should_checkpoint, should_generate, SampleGenerator};
use super::setup::TrainingSetup;
use super::tracker::{create_tracker, Monitor};
use super::RunConfig;
use crate::error::{Error, Result};
use crate::loaders::ComponentSource;
use crate::models::ModelEnsemble;

const RUN_CONFIG_FILENAME: &str = "run_config.yaml";

/// Directories a run writes to
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub root: PathBuf,
    pub logs_dir: PathBuf,
    /// Scratch space for sample images, emptied at every generation
    pub samples_dir: PathBuf,
}

impl OutputLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            logs_dir: root.join("logs"),
            samples_dir: root.join(".tmp_imgs"),
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.logs_dir)?;
        Ok(())
    }
}

/// Process-scoped state handed to every stage of a worker.
pub struct RunContext<'g> {
    pub rank: usize,
    pub world_size: usize,
    pub is_coordinator: bool,
    pub device: Device,
    pub group: &'g dyn ProcessGroup,
    pub rng: StdRng,
    pub monitor: Monitor,
    pub layout: OutputLayout,
}

impl<'g> RunContext<'g> {
    pub fn new(group: &'g dyn ProcessGroup, device: Device, seed: u64, monitor: Monitor, layout: OutputLayout) -> Self {
        let rank = group.rank();
        Self {
            rank,
            world_size: group.world_size(),
            is_coordinator: group.is_coordinator(),
            device,
            group,
            rng: StdRng::seed_from_u64(seed.wrapping_add(rank as u64)),
            monitor,
            layout,
        }
    }
}

/// What the coordinator reports once the run is over.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub global_step: usize,
    pub first_epoch: usize,
    pub epochs_run: usize,
    /// Checkpoints still on disk, oldest first
    pub checkpoints: Vec<PathBuf>,
    pub final_loss: Option<f64>,
}

/// Run a complete fine-tuning job.
pub fn launch(config: &RunConfig, source: &dyn ComponentSource, dataset: &dyn Dataset) -> Result<RunSummary> {
    config.validate()?;
    if dataset.is_empty() {
        return Err(Error::resource("dataset", "no samples"));
    }

    let devices = config
        .distributed
        .devices
        .iter()
        .map(|spec| parse_device(spec))
        .collect::<Result<Vec<_>>>()?;

    // Fail fast on bookkeeping before anything is loaded
    TrainingSetup::compute(
        dataset.len(),
        config.train.batch_size,
        devices.len(),
        config.train.gradient_accumulation_steps,
        config.sample.nb_generated_images,
        config.sample.eval_batch_size,
        0,
    )?;

    if devices.len() == 1 {
        let device = devices.into_iter().next().unwrap_or(Device::Cpu);
        return run_worker(config, source, dataset, &SingleProcess, device);
    }

    let groups = LocalGroup::create(devices.len());
    let results: Vec<Result<RunSummary>> = std::thread::scope(|scope| {
        let handles: Vec<_> = groups
            .iter()
            .zip(devices)
            .map(|(group, device)| {
                scope.spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        run_worker(config, source, dataset, group, device)
                    }))
                    .unwrap_or_else(|_| Err(Error::distributed(format!("rank {} panicked", group.rank()))));
                    if let Err(err) = &outcome {
                        group.abort(&format!("rank {} failed: {err}", group.rank()));
                    }
                    outcome
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::distributed("worker thread could not be joined")))
            })
            .collect()
    });

    first_failure(results)
}

/// The coordinator's summary, or the root cause when any worker failed.
fn first_failure(results: Vec<Result<RunSummary>>) -> Result<RunSummary> {
    let mut summary = None;
    let mut peer_failure = None;
    for result in results {
        match result {
            Ok(s) => {
                summary.get_or_insert(s);
            }
            Err(Error::Distributed(reason)) => {
                peer_failure.get_or_insert(Error::Distributed(reason));
            }
            Err(err) => return Err(err),
        }
    }
    match (peer_failure, summary) {
        (Some(err), _) => Err(err),
        (None, Some(summary)) => Ok(summary),
        (None, None) => Err(Error::distributed("no worker reported a result")),
    }
}

fn run_worker(
    config: &RunConfig,
    source: &dyn ComponentSource,
    dataset: &dyn Dataset,
    group: &dyn ProcessGroup,
    device: Device,
) -> Result<RunSummary> {
    let layout = OutputLayout::new(&config.save.output_dir);
    info!(
        "[rank {}/{}] job {} on {:?}: batch size {}, {} epochs, precision {:?}",
        group.rank(),
        group.world_size(),
        config.job,
        device,
        config.train.batch_size,
        config.train.num_epochs,
        config.train.mixed_precision
    );

    let monitor = if group.is_coordinator() {
        layout.create()?;
        config.save_snapshot(&layout.root.join(RUN_CONFIG_FILENAME))?;
        match create_tracker(config.logging.tracker, &layout.logs_dir, &config.project_name()) {
            Ok(tracker) => Monitor::new(Some(tracker)),
            Err(err) => {
                warn!("Monitoring disabled: {err}");
                Monitor::disabled()
            }
        }
    } else {
        Monitor::disabled()
    };
    group.barrier()?;

    let mut ctx = RunContext::new(group, device, config.train.seed, monitor, layout);
    let result = train(config, source, dataset, &mut ctx);
    ctx.monitor.finish();
    result
}

fn train(
    config: &RunConfig,
    source: &dyn ComponentSource,
    dataset: &dyn Dataset,
    ctx: &mut RunContext<'_>,
) -> Result<RunSummary> {
    let weight_dtype = config.train.mixed_precision.weight_dtype();
    let mut ensemble = source.load(&ctx.device, weight_dtype, config.model.learn_denoiser_from_scratch)?;
    let params = ensemble.trainable_parameters().to_vec();
    // Replicas start from the coordinator's weights, whatever their initialization
    ctx.group.broadcast_parameters(&params)?;
    if config.ema.enabled {
        ensemble.ema = Some(EmaModel::new(&params, &config.ema)?);
    }

    let noise_scheduler = NoiseScheduler::new(&config.noise_scheduler)?;
    let mut optimizer = AdamW::new(params.clone(), &config.optimizer);

    let train_config = &config.train;
    let setup = TrainingSetup::compute(
        dataset.len(),
        train_config.batch_size,
        ctx.world_size,
        train_config.gradient_accumulation_steps,
        config.sample.nb_generated_images,
        config.sample.eval_batch_size,
        ctx.rank,
    )?;
    let max_train_steps = setup.max_train_steps(train_config.num_epochs);
    let mut lr_scheduler = LrScheduler::new(&config.lr_scheduler, config.optimizer.learning_rate, max_train_steps);

    if ctx.is_coordinator {
        info!("***** Running training *****");
        info!("  Pretrained source = {}", source.describe().location);
        info!("  Num examples = {}", dataset.len());
        info!("  Num epochs = {}", train_config.num_epochs);
        info!("  Batch size per device = {}", train_config.batch_size);
        info!(
            "  Total train batch size = {}",
            train_config.batch_size * ctx.world_size * train_config.gradient_accumulation_steps
        );
        info!("  Gradient accumulation steps = {}", train_config.gradient_accumulation_steps);
        info!("  Update steps per epoch = {}", setup.num_update_steps_per_epoch);
        info!("  Total optimization steps = {max_train_steps}");
        info!("  Trainable parameters = {}", ensemble.num_trainable_parameters());
        info!("  EMA = {}", config.ema.enabled);
    }

    let checkpoints = CheckpointManager::new(&config.save.output_dir, config.save.checkpoints_total_limit);
    let plan = resume(
        config,
        &checkpoints,
        &setup,
        &params,
        &mut ensemble,
        &mut optimizer,
        &mut lr_scheduler,
    )?;
    if ctx.is_coordinator && plan.is_resumed() {
        info!(
            "Resuming at global step {} (epoch {}, skipping {} batches)",
            plan.global_step, plan.first_epoch, plan.skip_batches
        );
    }
    if plan.first_epoch >= train_config.num_epochs {
        warn!(
            "Checkpoint at step {} already covers all {} epochs",
            plan.global_step, train_config.num_epochs
        );
    }

    let sampler = EpochSampler::new(
        dataset.len(),
        train_config.batch_size,
        ctx.world_size,
        ctx.rank,
        train_config.seed,
        config.dataset.shuffle,
    );
    let loader = DataLoader::new(dataset, sampler, &config.dataset)?;
    let driver = EpochDriver::new(
        &setup,
        &noise_scheduler,
        train_config.max_grad_norm.map(f64::from),
        config.logging.log_every_n_steps,
    );
    let generator = SampleGenerator::new(&config.sample, &config.noise_scheduler, &setup)?;

    let num_epochs = train_config.num_epochs;
    let mut global_step = plan.global_step;
    let mut epochs_run = 0;
    let mut final_loss = None;
    for epoch in plan.first_epoch..num_epochs {
        let outcome = driver.run_epoch(
            ctx,
            &loader,
            epoch,
            &plan,
            global_step,
            Trainables {
                ensemble: &mut ensemble,
                optimizer: &mut optimizer,
                lr_scheduler: &mut lr_scheduler,
            },
        )?;
        global_step = outcome.global_step;
        epochs_run += 1;
        final_loss = outcome.mean_loss.or(final_loss);
        if ctx.is_coordinator {
            info!(
                "Epoch {epoch} done: global step {global_step}, {} updates, mean loss {}",
                outcome.updates,
                outcome.mean_loss.map(|l| format!("{l:.6}")).unwrap_or_else(|| "n/a".to_string())
            );
        }

        if should_generate(epoch, num_epochs, config.sample.save_images_epochs) {
            generator.generate(ctx, &mut ensemble, dataset, epoch)?;
            if ctx.is_coordinator {
                report_metrics(ctx, dataset, epoch, global_step, config.sample.nb_generated_images)?;
            }
        }

        if should_checkpoint(epoch, num_epochs, config.save.save_model_epochs, ctx.is_coordinator) {
            save_checkpoint(&checkpoints, source, &ensemble, &optimizer, &lr_scheduler, &setup, epoch, global_step)?;
        }

        ctx.group.barrier()?;
    }

    let surviving = if ctx.is_coordinator {
        checkpoints.list()?.into_iter().map(|r| r.directory).collect()
    } else {
        Vec::new()
    };
    if ctx.is_coordinator {
        info!("Training finished at global step {global_step}");
    }

    Ok(RunSummary {
        global_step,
        first_epoch: plan.first_epoch,
        epochs_run,
        checkpoints: surviving,
        final_loss,
    })
}

/// Restore the configured checkpoint, if any, and plan where to pick up.
fn resume(
    config: &RunConfig,
    checkpoints: &CheckpointManager,
    setup: &TrainingSetup,
    params: &[(String, candle_core::Var)],
    ensemble: &mut ModelEnsemble,
    optimizer: &mut AdamW,
    lr_scheduler: &mut LrScheduler,
) -> Result<ResumePlan> {
    let Some(target) = &config.save.resume_from_checkpoint else {
        return Ok(ResumePlan::fresh());
    };
    let Some(record) = checkpoints.resolve(&ResumeTarget::parse(target), config.save.allow_missing_checkpoint)?
    else {
        return Ok(ResumePlan::fresh());
    };

    let state = checkpoints.restore(
        &record,
        RestoreTarget {
            params,
            ema: ensemble.ema.as_mut(),
            optimizer,
            scheduler: lr_scheduler,
        },
    )?;
    Ok(ResumePlan::from_global_step(
        state.global_step,
        setup.num_update_steps_per_epoch,
        setup.gradient_accumulation_steps,
    ))
}

#[allow(clippy::too_many_arguments)]
fn save_checkpoint(
    checkpoints: &CheckpointManager,
    source: &dyn ComponentSource,
    ensemble: &ModelEnsemble,
    optimizer: &AdamW,
    lr_scheduler: &LrScheduler,
    setup: &TrainingSetup,
    epoch: usize,
    global_step: usize,
) -> Result<()> {
    checkpoints.save(SaveRequest {
        state: TrainingState {
            global_step,
            epoch,
            resume_step: global_step % setup.num_update_steps_per_epoch,
        },
        params: ensemble.trainable_parameters(),
        ema: ensemble.ema.as_ref(),
        optimizer,
        scheduler: lr_scheduler,
        pretrained: source.describe(),
    })?;
    checkpoints.export_pipeline(source, &ensemble.export_weights())?;
    Ok(())
}
