//! One pass over the training data
//!
//! Each micro-batch is either skipped (already consumed before a resume),
//! accumulated, or closes an accumulation window and triggers an update.

use candle_core::Tensor;
use log::{debug, info};

use super::checkpoint::ResumePlan;
use super::data_loader::DataLoader;
use super::gradient_accumulator::GradientAccumulator;
use super::lr_scheduler::LrScheduler;
use super::noise_scheduler::{sample_noise, NoiseScheduler};
use super::optimizer::{clip_grad_norm, AdamW};
use super::orchestrator::RunContext;
use super::setup::TrainingSetup;
use crate::error::Result;
use crate::models::ModelEnsemble;

/// What happens to micro-batch `i` of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Skip,
    Accumulate,
    Step,
}

pub fn batch_phase(setup: &TrainingSetup, plan: &ResumePlan, epoch: usize, batch_index: usize) -> BatchPhase {
    if epoch == plan.first_epoch && batch_index < plan.skip_batches {
        BatchPhase::Skip
    } else if setup.is_update_boundary(batch_index) {
        BatchPhase::Step
    } else {
        BatchPhase::Accumulate
    }
}

/// The mutable training state an epoch works on.
pub struct Trainables<'a> {
    pub ensemble: &'a mut ModelEnsemble,
    pub optimizer: &'a mut AdamW,
    pub lr_scheduler: &'a mut LrScheduler,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochOutcome {
    pub global_step: usize,
    pub updates: usize,
    pub skipped_batches: usize,
    /// Mean unscaled loss over the micro-batches actually computed
    pub mean_loss: Option<f64>,
}

pub struct EpochDriver<'a> {
    setup: &'a TrainingSetup,
    noise_scheduler: &'a NoiseScheduler,
    max_grad_norm: Option<f64>,
    log_every_n_steps: usize,
}

impl<'a> EpochDriver<'a> {
    pub fn new(
        setup: &'a TrainingSetup,
        noise_scheduler: &'a NoiseScheduler,
        max_grad_norm: Option<f64>,
        log_every_n_steps: usize,
    ) -> Self {
        Self {
            setup,
            noise_scheduler,
            max_grad_norm,
            log_every_n_steps: log_every_n_steps.max(1),
        }
    }

    /// Train for one epoch starting at `global_step`.
    pub fn run_epoch(
        &self,
        ctx: &mut RunContext<'_>,
        loader: &DataLoader<'_>,
        epoch: usize,
        plan: &ResumePlan,
        mut global_step: usize,
        trainables: Trainables<'_>,
    ) -> Result<EpochOutcome> {
        let Trainables {
            ensemble,
            optimizer,
            lr_scheduler,
        } = trainables;
        let params = ensemble.trainable_parameters().to_vec();
        let batches = loader.batches(epoch);
        let last_index = batches.len().saturating_sub(1);

        let progress = EpochProgress::new(batches.len(), ctx.is_coordinator, epoch);
        let mut accumulator = GradientAccumulator::new();
        let mut window_loss = 0.0;
        let mut window_batches = 0usize;
        let mut epoch_loss = 0.0;
        let mut computed = 0usize;
        let mut updates = 0usize;
        let mut skipped = 0usize;

        for (i, indices) in batches.iter().enumerate() {
            let phase = batch_phase(self.setup, plan, epoch, i);
            if phase == BatchPhase::Skip {
                skipped += 1;
                progress.advance(None);
                continue;
            }

            let batch = loader.load(indices, &mut ctx.rng)?;
            let loss = self.micro_batch(ctx, ensemble, &batch.pixels, &batch.captions)?;
            let loss_value = loss.to_scalar::<f32>()? as f64;
            let grads = (loss / self.setup.gradient_accumulation_steps as f64)?.backward()?;
            accumulator.accumulate_from(&params, &grads)?;

            window_loss += loss_value;
            window_batches += 1;
            epoch_loss += loss_value;
            computed += 1;

            if phase == BatchPhase::Step {
                let micro_batches = accumulator.micro_batches();
                let mut summed = accumulator.get_and_reset();
                ctx.group.all_reduce_mean(&mut summed)?;
                if let Some(max_norm) = self.max_grad_norm {
                    let norm = clip_grad_norm(&mut summed, max_norm)?;
                    debug!("Gradient norm {norm:.4} before clipping");
                }

                let lr = lr_scheduler.step();
                optimizer.step(&summed, lr)?;
                global_step += 1;
                updates += 1;

                if let Some(ema) = ensemble.ema.as_mut() {
                    ema.step(&params)?;
                }

                let step_loss = window_loss / window_batches.max(1) as f64;
                window_loss = 0.0;
                window_batches = 0;

                if global_step % self.log_every_n_steps == 0 || i == last_index {
                    ctx.monitor
                        .log_scalars(global_step, &[("loss", step_loss), ("lr", lr), ("epoch", epoch as f64)]);
                    if ctx.is_coordinator {
                        info!(
                            "Step {}: loss = {:.6}, lr = {:.2e} ({} micro-batches)",
                            global_step, step_loss, lr, micro_batches
                        );
                    }
                }
                progress.advance(Some((step_loss, lr)));
            } else {
                progress.advance(None);
            }
        }
        progress.finish();

        Ok(EpochOutcome {
            global_step,
            updates,
            skipped_batches: skipped,
            mean_loss: (computed > 0).then(|| epoch_loss / computed as f64),
        })
    }

    /// Forward pass of one micro-batch, returning the unscaled loss.
    fn micro_batch(
        &self,
        ctx: &mut RunContext<'_>,
        ensemble: &ModelEnsemble,
        pixels: &Tensor,
        captions: &[String],
    ) -> Result<Tensor> {
        let context = ensemble.text_conditioner.encode(captions)?.detach();
        let pixels = pixels.to_device(&ctx.device)?;
        let latents = ensemble.autoencoder.encode(&pixels)?.detach();

        let noise = sample_noise(latents.dims(), latents.device(), &mut ctx.rng)?;
        let timesteps = self.noise_scheduler.sample_timesteps(latents.dim(0)?, &mut ctx.rng);
        let noisy_latents = self.noise_scheduler.add_noise(&latents, &noise, &timesteps)?;

        let prediction = ensemble.denoiser.forward(&noisy_latents, &timesteps, &context)?;
        let target = self.noise_scheduler.training_target(&latents, &noise, &timesteps)?;
        Ok(candle_nn::loss::mse(&prediction, &target)?)
    }
}

struct EpochProgress {
    #[cfg(feature = "progress-bar")]
    bar: Option<indicatif::ProgressBar>,
}

#[cfg(feature = "progress-bar")]
impl EpochProgress {
    fn new(len: usize, visible: bool, epoch: usize) -> Self {
        let bar = visible.then(|| {
            let bar = indicatif::ProgressBar::new(len as u64);
            if let Ok(style) = indicatif::ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ETA:{eta} {msg}")
            {
                bar.set_style(style.progress_chars("=>-"));
            }
            bar.set_prefix(format!("epoch {epoch}"));
            bar
        });
        Self { bar }
    }

    fn advance(&self, update: Option<(f64, f64)>) {
        if let Some(bar) = &self.bar {
            if let Some((loss, lr)) = update {
                bar.set_message(format!("loss {loss:.4} lr {lr:.2e}"));
            }
            bar.inc(1);
        }
    }

    fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

#[cfg(not(feature = "progress-bar"))]
impl EpochProgress {
    fn new(_len: usize, _visible: bool, _epoch: usize) -> Self {
        Self {}
    }

    fn advance(&self, _update: Option<(f64, f64)>) {}

    fn finish(&self) {}
}
