//! Tiny stand-ins for the pretrained components and the dataset.
#![allow(dead_code)]

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use latent_tuner::error::{Error, Result};
use latent_tuner::loaders::{ComponentSource, SourceMetadata};
use latent_tuner::models::{Autoencoder, Denoiser, ModelEnsemble, TextConditioner};
use latent_tuner::trainers::checkpoint::write_safetensors;
use latent_tuner::trainers::data_loader::{Dataset, Sample};
use latent_tuner::trainers::{LrScheduleKind, RunConfig, TrackerKind};

pub const LATENT_CHANNELS: usize = 4;
pub const CONTEXT_DIM: usize = 4;
pub const RESOLUTION: usize = 8;

/// Per-pixel linear map over channels, shifted by the pooled text context and the timestep.
pub struct ToyDenoiser {
    varmap: VarMap,
    weight: Tensor,
    bias: Tensor,
    context_weight: Tensor,
    time_weight: Tensor,
    forwards: Arc<AtomicUsize>,
}

impl ToyDenoiser {
    pub fn new(device: &Device, forwards: Arc<AtomicUsize>, seed: u64) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let c = LATENT_CHANNELS;
        let weight = vb.get_with_hints((c, c), "proj.weight", Init::Const(0.0))?;
        let bias = vb.get_with_hints(c, "proj.bias", Init::Const(0.0))?;
        let context_weight = vb.get_with_hints((c, CONTEXT_DIM), "context.weight", Init::Const(0.0))?;
        let time_weight = vb.get_with_hints(c, "time.weight", Init::Const(0.0))?;

        let mut rng = StdRng::seed_from_u64(seed);
        let denoiser = Self {
            varmap,
            weight,
            bias,
            context_weight,
            time_weight,
            forwards,
        };
        for (_, var) in denoiser.named_parameters() {
            let values: Vec<f32> = (0..var.elem_count()).map(|_| rng.gen_range(-0.3..0.3)).collect();
            var.set(&Tensor::from_vec(values, var.shape(), device)?)?;
        }
        Ok(denoiser)
    }
}

impl Denoiser for ToyDenoiser {
    fn forward(&self, latents: &Tensor, timesteps: &[usize], context: &Tensor) -> Result<Tensor> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        let (b, c, h, w) = latents.dims4()?;
        let x = latents.permute((0, 2, 3, 1))?.reshape((b * h * w, c))?;
        let y = x.matmul(&self.weight.t()?)?.broadcast_add(&self.bias)?;
        let y = y.reshape((b, h, w, c))?.permute((0, 3, 1, 2))?;

        let cond = context.mean(1)?.matmul(&self.context_weight.t()?)?.reshape((b, c, 1, 1))?;
        let t: Vec<f32> = timesteps.iter().map(|&t| t as f32 / 1000.0).collect();
        let t = Tensor::from_vec(t, (b, 1, 1, 1), latents.device())?;
        let time = t.broadcast_mul(&self.time_weight.reshape((1, c, 1, 1))?)?;
        Ok(y.broadcast_add(&cond)?.broadcast_add(&time)?)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap();
        let mut params: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }
}

/// 2x average pooling; the fourth latent channel is the pooled luminance.
pub struct PoolingAutoencoder;

impl Autoencoder for PoolingAutoencoder {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let pooled = images.avg_pool2d(2)?;
        let luminance = pooled.mean_keepdim(1)?;
        Ok(Tensor::cat(&[&pooled, &luminance], 1)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        let rgb = latents.narrow(1, 0, 3)?.upsample_nearest2d(h * 2, w * 2)?;
        Ok(rgb.clamp(-1f32, 1f32)?)
    }

    fn latent_channels(&self) -> usize {
        LATENT_CHANNELS
    }

    fn downscale_factor(&self) -> usize {
        2
    }
}

/// Two tokens per prompt derived from its bytes.
pub struct LookupTextEncoder {
    device: Device,
}

impl TextConditioner for LookupTextEncoder {
    fn encode(&self, prompts: &[String]) -> Result<Tensor> {
        let mut values = Vec::with_capacity(prompts.len() * 2 * CONTEXT_DIM);
        for prompt in prompts {
            let sum: u32 = prompt.bytes().map(u32::from).sum();
            for token in 0..2 {
                for d in 0..CONTEXT_DIM {
                    let v = ((sum as usize + token * 7 + d * 13) % 17) as f32 / 17.0;
                    values.push(if prompt.is_empty() { 0.0 } else { v });
                }
            }
        }
        Ok(Tensor::from_vec(values, (prompts.len(), 2, CONTEXT_DIM), &self.device)?)
    }
}

/// Synthetic labelled images held in memory.
pub struct MemoryDataset {
    class_names: Vec<String>,
    samples: Vec<(Tensor, usize)>,
}

impl MemoryDataset {
    pub fn new(len: usize) -> Self {
        let class_names = vec!["tulip".to_string(), "rose".to_string()];
        let samples = (0..len)
            .map(|i| {
                let class_index = i % class_names.len();
                let base = i as f32 / len as f32 * 1.6 - 0.8;
                let values: Vec<f32> = (0..3 * RESOLUTION * RESOLUTION)
                    .map(|p| (base + (p % 5) as f32 * 0.05).clamp(-1.0, 1.0))
                    .collect();
                let pixels = Tensor::from_vec(values, (3, RESOLUTION, RESOLUTION), &Device::Cpu).unwrap();
                (pixels, class_index)
            })
            .collect();
        Self { class_names, samples }
    }
}

impl Dataset for MemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn resolution(&self) -> usize {
        RESOLUTION
    }

    fn caption_for_class(&self, class_index: usize) -> String {
        format!("a photo of a {}", self.class_names[class_index])
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let (pixels, class_index) = self
            .samples
            .get(index)
            .ok_or_else(|| Error::resource("memory dataset", format!("index {index} out of range")))?;
        Ok(Sample {
            pixels: pixels.clone(),
            caption: self.caption_for_class(*class_index),
            class_index: *class_index,
        })
    }
}

/// Pretrained denoiser initialization
pub const PRETRAINED_SEED: u64 = 1234;

/// Component source building the toy models; counts denoiser forward passes.
///
/// A pretrained load always yields the same weights. Learning from scratch
/// seeds every load differently, like a random initialization would.
#[derive(Default)]
pub struct ToySource {
    pub forwards: Arc<AtomicUsize>,
    pub loads: AtomicUsize,
    denoisers: Mutex<Vec<Vec<(String, Var)>>>,
}

impl ToySource {
    pub fn forward_passes(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }

    pub fn ensemble(&self, device: &Device) -> ModelEnsemble {
        self.load(device, DType::F32, false).unwrap()
    }

    /// Current weights of every denoiser this source has built, in load order.
    pub fn denoiser_values(&self) -> Vec<Vec<(String, Vec<f32>)>> {
        self.denoisers
            .lock()
            .unwrap()
            .iter()
            .map(|params| {
                params
                    .iter()
                    .map(|(name, var)| (name.clone(), var.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
                    .collect()
            })
            .collect()
    }
}

impl ComponentSource for ToySource {
    fn describe(&self) -> SourceMetadata {
        SourceMetadata {
            name: "toy".to_string(),
            location: "memory".to_string(),
            components: vec!["unet".to_string(), "vae".to_string(), "text_encoder".to_string()],
        }
    }

    fn load(&self, device: &Device, _weight_dtype: DType, denoiser_from_scratch: bool) -> Result<ModelEnsemble> {
        let index = self.loads.fetch_add(1, Ordering::SeqCst) as u64;
        let seed = if denoiser_from_scratch { PRETRAINED_SEED + 1 + index } else { PRETRAINED_SEED };
        let ensemble = ModelEnsemble::new(
            Box::new(ToyDenoiser::new(device, self.forwards.clone(), seed)?),
            Box::new(PoolingAutoencoder),
            Box::new(LookupTextEncoder { device: device.clone() }),
        );
        self.denoisers.lock().unwrap().push(ensemble.trainable_parameters().to_vec());
        Ok(ensemble)
    }

    fn export_pipeline(&self, dest: &Path, denoiser_weights: &HashMap<String, Tensor>) -> Result<()> {
        fs::create_dir_all(dest.join("unet"))?;
        fs::write(dest.join("model_index.json"), "{\"_class_name\": \"ToyPipeline\"}")?;
        write_safetensors(
            &dest.join("unet").join("diffusion_pytorch_model.safetensors"),
            denoiser_weights,
            HashMap::new(),
        )
    }
}

const MINIMAL: &str = r#"
model:
  pretrained_path: toy
dataset:
  root: memory
  resolution: 8
  num_workers: 1
save:
  output_dir: unused
"#;

/// Small CPU run: constant LR, generation only on the final epoch,
/// a checkpoint after every epoch but the first.
pub fn config(output_dir: &Path, num_epochs: usize, batch_size: usize, grad_accum: usize) -> RunConfig {
    let mut config: RunConfig = serde_yaml::from_str(MINIMAL).unwrap();
    config.save.output_dir = output_dir.to_path_buf();
    config.save.save_model_epochs = 1;
    config.train.num_epochs = num_epochs;
    config.train.batch_size = batch_size;
    config.train.gradient_accumulation_steps = grad_accum;
    config.train.seed = 7;
    config.optimizer.learning_rate = 1e-3;
    config.lr_scheduler.kind = LrScheduleKind::Constant;
    config.lr_scheduler.warmup_steps = 0;
    config.sample.save_images_epochs = 100;
    config.sample.nb_generated_images = 2;
    config.sample.eval_batch_size = 2;
    config.sample.num_inference_steps = 2;
    config.sample.guidance_scale = 1.0;
    config.logging.tracker = TrackerKind::Jsonl;
    config.distributed.devices = vec!["cpu".to_string()];
    config
}

/// `(step, scalars)` of every scalar record in the run's metrics log.
pub fn logged_scalars(output_dir: &Path) -> Vec<(usize, serde_json::Value)> {
    let content = fs::read_to_string(output_dir.join("logs").join("metrics.jsonl")).unwrap_or_default();
    content
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|record| {
            let scalars = record.get("scalars")?.clone();
            Some((record.get("step")?.as_u64()? as usize, scalars))
        })
        .collect()
}

/// Steps at which a training loss was reported.
pub fn loss_steps(output_dir: &Path) -> Vec<usize> {
    logged_scalars(output_dir)
        .into_iter()
        .filter(|(_, scalars)| scalars.get("loss").is_some())
        .map(|(step, _)| step)
        .collect()
}
