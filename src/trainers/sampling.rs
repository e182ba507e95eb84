//! Periodic sample generation and evaluation metrics

use candle_core::{DType, Device, Tensor};
use image::{ImageBuffer, Rgb};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::data_loader::{load_image, Dataset};
use super::noise_scheduler::{sample_noise, NoiseScheduler};
use super::orchestrator::RunContext;
use super::setup::TrainingSetup;
use super::{NoiseSchedulerConfig, SampleConfig};
use crate::error::{Error, Result};
use crate::models::ModelEnsemble;

/// Generate at the cadence and on the final epoch, never at epoch 0.
pub fn should_generate(epoch: usize, num_epochs: usize, every: usize) -> bool {
    let on_cadence = every > 0 && epoch % every == 0;
    (on_cadence || epoch + 1 == num_epochs) && epoch > 0
}

/// Same policy as sample generation, restricted to the coordinator.
pub fn should_checkpoint(epoch: usize, num_epochs: usize, every: usize, is_coordinator: bool) -> bool {
    is_coordinator && should_generate(epoch, num_epochs, every)
}

/// Save a `[C, H, W]` tensor in [-1, 1] as an 8-bit RGB image.
pub fn save_tensor_as_image(tensor: &Tensor, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let (c, h, w) = tensor.dims3()?;
    let tensor = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let tensor = match c {
        3 => tensor,
        1 => tensor.repeat((3, 1, 1))?,
        other => return Err(Error::Metric(format!("cannot save an image with {other} channels"))),
    };

    // Denormalize from [-1, 1] to [0, 255], HWC layout for the image crate
    let data: Vec<u8> = ((tensor + 1.0)? * 127.5)?
        .clamp(0f32, 255f32)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|x| x.round() as u8)
        .collect();

    let img = ImageBuffer::<Rgb<u8>, _>::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| Error::Metric(format!("failed to create a {w}x{h} image buffer")))?;
    img.save(path)?;
    Ok(())
}

/// Samples written by this epoch's generation pass, across all ranks.
pub fn generated_images(samples_dir: &Path, epoch: usize) -> Result<Vec<PathBuf>> {
    let prefix = format!("epoch{epoch}_");
    let mut paths: Vec<PathBuf> = fs::read_dir(samples_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(".png"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalMetrics {
    pub frechet_color_distance: f64,
    pub generated_pixel_std: f64,
    pub num_generated: usize,
    pub num_real: usize,
}

impl EvalMetrics {
    pub fn scalars(&self) -> [(&'static str, f64); 2] {
        [
            ("frechet_color_distance", self.frechet_color_distance),
            ("generated_pixel_std", self.generated_pixel_std),
        ]
    }
}

/// Per-channel mean and standard deviation of a `[C, H, W]` image.
fn color_features(pixels: &Tensor) -> Result<Vec<f64>> {
    let flat = pixels.to_dtype(DType::F32)?.flatten_from(1)?;
    let mean = flat.mean_keepdim(1)?;
    let std = flat.broadcast_sub(&mean)?.sqr()?.mean(1)?.sqrt()?;
    let mut features: Vec<f64> = mean.squeeze(1)?.to_vec1::<f32>()?.into_iter().map(f64::from).collect();
    features.extend(std.to_vec1::<f32>()?.into_iter().map(f64::from));
    Ok(features)
}

fn gaussian_fit(features: &[Vec<f64>]) -> (Vec<f64>, Vec<f64>) {
    let n = features.len() as f64;
    let dims = features.first().map(Vec::len).unwrap_or(0);
    let mean: Vec<f64> = (0..dims).map(|d| features.iter().map(|f| f[d]).sum::<f64>() / n).collect();
    let var: Vec<f64> = (0..dims)
        .map(|d| features.iter().map(|f| (f[d] - mean[d]).powi(2)).sum::<f64>() / (n - 1.0))
        .collect();
    (mean, var)
}

/// Fréchet distance between diagonal Gaussians fitted to color features.
pub fn frechet_color_distance(generated: &[Vec<f64>], real: &[Vec<f64>]) -> Result<f64> {
    if generated.len() < 2 || real.len() < 2 {
        return Err(Error::Metric(format!(
            "need at least two generated and two real samples, got {} and {}",
            generated.len(),
            real.len()
        )));
    }
    let (mu_g, var_g) = gaussian_fit(generated);
    let (mu_r, var_r) = gaussian_fit(real);
    Ok(mu_g
        .iter()
        .zip(&mu_r)
        .zip(var_g.iter().zip(&var_r))
        .map(|((mg, mr), (vg, vr))| (mg - mr).powi(2) + vg + vr - 2.0 * (vg * vr).sqrt())
        .sum())
}

/// Standard deviation of every generated pixel value; near zero means collapse.
pub fn generated_pixel_std(images: &[Tensor]) -> Result<f64> {
    if images.len() < 2 {
        return Err(Error::Metric(format!("need at least two generated samples, got {}", images.len())));
    }
    let flat = Tensor::cat(
        &images.iter().map(|t| t.flatten_all()).collect::<candle_core::Result<Vec<_>>>()?,
        0,
    )?
    .to_dtype(DType::F64)?;
    let mean = flat.mean_all()?;
    let var = flat.broadcast_sub(&mean)?.sqr()?.mean_all()?.to_scalar::<f64>()?;
    Ok(var.sqrt())
}

/// An unreadable evaluation input only costs this epoch's metrics.
fn metric_input(err: Error) -> Error {
    match err {
        Error::Metric(_) => err,
        other => Error::Metric(other.to_string()),
    }
}

/// Compare this epoch's generated images with up to `max_real` dataset images.
pub fn evaluate(generated: &[PathBuf], dataset: &dyn Dataset, max_real: usize) -> Result<EvalMetrics> {
    let resolution = dataset.resolution();
    let images = generated
        .iter()
        .map(|path| load_image(path, resolution).map_err(metric_input))
        .collect::<Result<Vec<_>>>()?;
    let real = (0..dataset.len().min(max_real))
        .map(|i| {
            dataset
                .get(i)
                .and_then(|s| color_features(&s.pixels))
                .map_err(metric_input)
        })
        .collect::<Result<Vec<_>>>()?;
    let fake = images.iter().map(color_features).collect::<Result<Vec<_>>>()?;

    Ok(EvalMetrics {
        frechet_color_distance: frechet_color_distance(&fake, &real)?,
        generated_pixel_std: generated_pixel_std(&images)?,
        num_generated: fake.len(),
        num_real: real.len(),
    })
}

/// Runs the inference pipeline with the current or EMA weights.
pub struct SampleGenerator<'a> {
    config: &'a SampleConfig,
    setup: &'a TrainingSetup,
    scheduler: NoiseScheduler,
}

impl<'a> SampleGenerator<'a> {
    pub fn new(config: &'a SampleConfig, noise_config: &NoiseSchedulerConfig, setup: &'a TrainingSetup) -> Result<Self> {
        let mut scheduler = NoiseScheduler::new(noise_config)?;
        scheduler.set_timesteps(config.num_inference_steps)?;
        Ok(Self {
            config,
            setup,
            scheduler,
        })
    }

    /// Every rank generates its share of the images. Returns the paths this
    /// rank wrote.
    pub fn generate(
        &self,
        ctx: &mut RunContext<'_>,
        ensemble: &mut ModelEnsemble,
        dataset: &dyn Dataset,
        epoch: usize,
    ) -> Result<Vec<PathBuf>> {
        let samples_dir = ctx.layout.samples_dir.clone();
        if ctx.is_coordinator {
            if samples_dir.exists() {
                fs::remove_dir_all(&samples_dir)?;
            }
            fs::create_dir_all(&samples_dir)?;
        }
        ctx.group.barrier()?;

        let params = ensemble.trainable_parameters().to_vec();
        if let Some(ema) = ensemble.ema.as_mut() {
            ema.store(&params)?;
            ema.copy_to(&params)?;
        }

        let generated = self.generate_images(ctx, ensemble, dataset, epoch, &samples_dir);

        if let Some(ema) = ensemble.ema.as_mut() {
            ema.restore(&params)?;
        }
        let generated = generated?;
        ctx.group.barrier()?;

        if ctx.is_coordinator {
            info!("Generated {} sample images for epoch {epoch} in {}", generated.len(), samples_dir.display());
        }
        Ok(generated)
    }

    fn generate_images(
        &self,
        ctx: &mut RunContext<'_>,
        ensemble: &ModelEnsemble,
        dataset: &dyn Dataset,
        epoch: usize,
        samples_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let num_classes = dataset.num_classes().max(1);
        let latent_size = dataset.resolution() / ensemble.autoencoder.downscale_factor();
        let channels = ensemble.autoencoder.latent_channels();
        let guided = self.config.guidance_scale > 1.0;

        let mut paths = Vec::with_capacity(self.setup.nb_eval_images);
        let mut index = self.setup.eval_image_offset;
        for &batch_size in &self.setup.eval_batch_sizes {
            let indices: Vec<usize> = (index..index + batch_size).collect();
            index += batch_size;

            let prompts: Vec<String> = indices
                .iter()
                .map(|i| dataset.caption_for_class(i % num_classes))
                .collect();
            let cond = ensemble.text_conditioner.encode(&prompts)?.detach();
            let context = if guided {
                let uncond = ensemble.text_conditioner.encode(&vec![String::new(); batch_size])?.detach();
                Tensor::cat(&[&uncond, &cond], 0)?
            } else {
                cond
            };

            let mut latents = sample_noise(&[batch_size, channels, latent_size, latent_size], &ctx.device, &mut ctx.rng)?;
            for &t in self.scheduler.timesteps() {
                let noise_pred = if guided {
                    let input = Tensor::cat(&[&latents, &latents], 0)?;
                    let out = ensemble.denoiser.forward(&input, &vec![t; 2 * batch_size], &context)?;
                    let chunks = out.chunk(2, 0)?;
                    let (uncond, cond) = (&chunks[0], &chunks[1]);
                    (uncond + ((cond - uncond)? * self.config.guidance_scale)?)?
                } else {
                    ensemble.denoiser.forward(&latents, &vec![t; batch_size], &context)?
                };
                latents = self.scheduler.step(&noise_pred.detach(), t, &latents)?.detach();
            }

            let images = ensemble.autoencoder.decode(&latents)?;
            for (j, &global_index) in indices.iter().enumerate() {
                let path = samples_dir.join(format!("epoch{epoch}_rank{}_{global_index}.png", ctx.rank));
                save_tensor_as_image(&images.get(j)?, &path)?;
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

/// Log metrics for this epoch's images, keeping metric failures non-fatal.
pub fn report_metrics(
    ctx: &mut RunContext<'_>,
    dataset: &dyn Dataset,
    epoch: usize,
    global_step: usize,
    max_real: usize,
) -> Result<Option<EvalMetrics>> {
    let outcome = generated_images(&ctx.layout.samples_dir, epoch)
        .map_err(metric_input)
        .and_then(|generated| {
            ctx.monitor.log_images(global_step, "samples", &generated);
            evaluate(&generated, dataset, max_real)
        });
    match outcome {
        Ok(metrics) => {
            info!(
                "Epoch {epoch}: frechet_color_distance = {:.4}, generated_pixel_std = {:.4} ({} generated, {} real)",
                metrics.frechet_color_distance, metrics.generated_pixel_std, metrics.num_generated, metrics.num_real
            );
            ctx.monitor.log_scalars(global_step, &metrics.scalars());
            Ok(Some(metrics))
        }
        Err(err) if !err.is_fatal() => {
            warn!("Skipping evaluation metrics for epoch {epoch}: {err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_zero_never_triggers() {
        assert!(!should_generate(0, 10, 1));
        assert!(!should_generate(0, 1, 5));
        assert!(!should_checkpoint(0, 10, 1, true));
    }

    #[test]
    fn triggers_on_cadence_and_final_epoch() {
        let fired: Vec<usize> = (0..10).filter(|&e| should_generate(e, 10, 4)).collect();
        assert_eq!(fired, vec![4, 8, 9]);
    }

    #[test]
    fn only_coordinator_checkpoints() {
        assert!(should_checkpoint(3, 4, 2, true));
        assert!(!should_checkpoint(3, 4, 2, false));
    }

    #[test]
    fn identical_distributions_have_zero_distance() -> Result<()> {
        let features = vec![vec![0.1, 0.2], vec![0.3, 0.0], vec![-0.2, 0.5]];
        assert!(frechet_color_distance(&features, &features)?.abs() < 1e-12);

        let shifted: Vec<Vec<f64>> = features.iter().map(|f| f.iter().map(|x| x + 1.0).collect()).collect();
        let distance = frechet_color_distance(&shifted, &features)?;
        assert!((distance - 2.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn too_few_samples_is_a_non_fatal_metric_error() {
        let err = frechet_color_distance(&[vec![0.0]], &[vec![0.0], vec![1.0]]).unwrap_err();
        assert!(matches!(err, Error::Metric(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn saved_images_round_trip_through_the_loader() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("epoch1_rank0_0.png");
        let tensor = Tensor::from_vec(vec![-1f32, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0, -1.0, 1.0, -1.0, -1.0], (3, 2, 2), &Device::Cpu)?;
        save_tensor_as_image(&tensor, &path)?;

        let loaded = load_image(&path, 2)?;
        let diff = (loaded - &tensor)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-2);

        assert_eq!(generated_images(dir.path().join("nested").as_path(), 1)?, vec![path]);
        assert!(generated_images(dir.path().join("nested").as_path(), 2)?.is_empty());
        Ok(())
    }

    #[test]
    fn flat_images_have_zero_pixel_std() -> Result<()> {
        let flat = vec![Tensor::zeros((3, 4, 4), DType::F32, &Device::Cpu)?; 2];
        assert_eq!(generated_pixel_std(&flat)?, 0.0);
        Ok(())
    }
}
