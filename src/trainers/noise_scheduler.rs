//! Noise scheduler for latent diffusion training and DDIM sampling
//! Forward noising for the training loss, deterministic DDIM for inference

use candle_core::{Device, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

use super::{BetaSchedule, NoiseSchedulerConfig, PredictionType};
use crate::error::{Error, Result};

const STEPS_OFFSET: usize = 1;

#[derive(Debug, Clone)]
pub struct NoiseScheduler {
    num_train_timesteps: usize,
    prediction_type: PredictionType,
    alphas_cumprod: Vec<f64>,
    // Inference state
    timesteps: Vec<usize>,
    step_ratio: usize,
}

impl NoiseScheduler {
    pub fn new(config: &NoiseSchedulerConfig) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n < 2 {
            return Err(Error::configuration("num_train_timesteps must be at least 2"));
        }

        let betas = match config.beta_schedule {
            BetaSchedule::Linear => linear_betas(n, config.beta_start, config.beta_end),
            BetaSchedule::ScaledLinear => {
                let (start, end) = (config.beta_start.sqrt(), config.beta_end.sqrt());
                linear_betas(n, start, end).into_iter().map(|b| b * b).collect()
            }
            BetaSchedule::SquaredcosCapV2 => cosine_betas(n),
        };

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut prod = 1.0;
        for beta in betas {
            prod *= 1.0 - beta;
            alphas_cumprod.push(prod);
        }

        Ok(Self {
            num_train_timesteps: n,
            prediction_type: config.prediction_type,
            alphas_cumprod,
            timesteps: Vec::new(),
            step_ratio: 1,
        })
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_train_timesteps
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// Sample training timesteps uniformly in `[0, num_train_timesteps)`.
    pub fn sample_timesteps<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<usize> {
        (0..batch_size)
            .map(|_| rng.gen_range(0..self.num_train_timesteps))
            .collect()
    }

    /// `sqrt(a_t) * x0 + sqrt(1 - a_t) * noise`, one timestep per batch element
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let (sqrt_alpha, sqrt_one_minus) = self.coefficients(timesteps, original)?;
        let noisy = (sqrt_alpha.broadcast_mul(original)? + sqrt_one_minus.broadcast_mul(noise)?)?;
        Ok(noisy)
    }

    /// v-prediction target: `sqrt(a_t) * noise - sqrt(1 - a_t) * x0`
    pub fn get_velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let (sqrt_alpha, sqrt_one_minus) = self.coefficients(timesteps, sample)?;
        let velocity = (sqrt_alpha.broadcast_mul(noise)? - sqrt_one_minus.broadcast_mul(sample)?)?;
        Ok(velocity)
    }

    /// Regression target for the configured prediction type.
    pub fn training_target(&self, latents: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        match self.prediction_type {
            PredictionType::Epsilon => Ok(noise.clone()),
            PredictionType::VPrediction => self.get_velocity(latents, noise, timesteps),
            PredictionType::Sample => Ok(latents.clone()),
        }
    }

    /// Prepare `num_inference_steps` DDIM timesteps with leading spacing.
    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        if num_inference_steps == 0 || num_inference_steps > self.num_train_timesteps {
            return Err(Error::configuration(format!(
                "num_inference_steps must be in [1, {}], got {num_inference_steps}",
                self.num_train_timesteps
            )));
        }
        self.step_ratio = self.num_train_timesteps / num_inference_steps;
        let last = self.num_train_timesteps - 1;
        self.timesteps = (0..num_inference_steps)
            .rev()
            .map(|i| (i * self.step_ratio + STEPS_OFFSET).min(last))
            .collect();
        Ok(())
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Deterministic DDIM update (eta = 0) from timestep `t` to the previous one.
    pub fn step(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let alpha_prod_t = self.alpha_at(timestep)?;
        let alpha_prod_prev = match timestep.checked_sub(self.step_ratio) {
            Some(prev) => self.alpha_at(prev)?,
            // Past the first training timestep the sample is fully denoised
            None => 1.0,
        };
        let beta_prod_t = 1.0 - alpha_prod_t;

        let (pred_original, pred_epsilon) = match self.prediction_type {
            PredictionType::Epsilon => {
                let x0 = ((sample - (model_output * beta_prod_t.sqrt())?)? / alpha_prod_t.sqrt())?;
                (x0, model_output.clone())
            }
            PredictionType::Sample => {
                let eps = ((sample - (model_output * alpha_prod_t.sqrt())?)? / beta_prod_t.sqrt())?;
                (model_output.clone(), eps)
            }
            PredictionType::VPrediction => {
                let x0 = ((sample * alpha_prod_t.sqrt())? - (model_output * beta_prod_t.sqrt())?)?;
                let eps = ((model_output * alpha_prod_t.sqrt())? + (sample * beta_prod_t.sqrt())?)?;
                (x0, eps)
            }
        };

        let prev = ((pred_original * alpha_prod_prev.sqrt())?
            + (pred_epsilon * (1.0 - alpha_prod_prev).sqrt())?)?;
        Ok(prev)
    }

    fn alpha_at(&self, timestep: usize) -> Result<f64> {
        self.alphas_cumprod.get(timestep).copied().ok_or_else(|| {
            Error::configuration(format!(
                "timestep {timestep} outside [0, {})",
                self.num_train_timesteps
            ))
        })
    }

    fn coefficients(&self, timesteps: &[usize], like: &Tensor) -> Result<(Tensor, Tensor)> {
        let batch_size = like.dim(0)?;
        if timesteps.len() != batch_size {
            return Err(Error::configuration(format!(
                "{} timesteps for a batch of {batch_size}",
                timesteps.len()
            )));
        }
        let mut sqrt_alpha = Vec::with_capacity(batch_size);
        let mut sqrt_one_minus = Vec::with_capacity(batch_size);
        for &t in timesteps {
            let a = self.alpha_at(t)?;
            sqrt_alpha.push(a.sqrt() as f32);
            sqrt_one_minus.push((1.0 - a).sqrt() as f32);
        }

        // [batch_size, 1, 1, 1] so they broadcast over the latent dims
        let mut shape = vec![1usize; like.rank()];
        shape[0] = batch_size;
        let device: &Device = like.device();
        let sqrt_alpha = Tensor::from_vec(sqrt_alpha, shape.as_slice(), device)?.to_dtype(like.dtype())?;
        let sqrt_one_minus = Tensor::from_vec(sqrt_one_minus, shape.as_slice(), device)?.to_dtype(like.dtype())?;
        Ok((sqrt_alpha, sqrt_one_minus))
    }
}

/// Standard normal tensor drawn from `rng`, so runs are reproducible from the seed.
pub fn sample_noise<R: Rng>(shape: &[usize], device: &Device, rng: &mut R) -> Result<Tensor> {
    let count = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

fn linear_betas(n: usize, start: f64, end: f64) -> Vec<f64> {
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n as f64 - 1.0))
        .collect()
}

fn cosine_betas(n: usize) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
        })
        .collect()
}
