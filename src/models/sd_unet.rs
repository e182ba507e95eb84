//! Stable Diffusion 1.x/2.x UNet as a trainable denoiser

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::stable_diffusion::unet_2d;
use serde::Deserialize;
use std::path::Path;

use super::Denoiser;
use crate::error::{Error, Result};

/// Either one head dim for every block or one per block
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PerBlock {
    Single(usize),
    List(Vec<usize>),
}

impl PerBlock {
    fn get(&self, index: usize) -> usize {
        match self {
            PerBlock::Single(v) => *v,
            PerBlock::List(values) => values.get(index).or(values.last()).copied().unwrap_or(1),
        }
    }
}

/// Subset of a diffusers `unet/config.json`
#[derive(Debug, Clone, Deserialize)]
pub struct UnetConfigFile {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_in_channels")]
    pub out_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub down_block_types: Vec<String>,
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,
    pub cross_attention_dim: usize,
    #[serde(default = "default_head_dim")]
    pub attention_head_dim: PerBlock,
    #[serde(default)]
    pub transformer_layers_per_block: Option<PerBlock>,
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default)]
    pub use_linear_projection: bool,
    #[serde(default = "default_true")]
    pub flip_sin_to_cos: bool,
    #[serde(default)]
    pub freq_shift: f64,
    #[serde(default)]
    pub center_input_sample: bool,
    #[serde(default = "default_downsample_padding")]
    pub downsample_padding: usize,
    #[serde(default = "default_mid_block_scale_factor")]
    pub mid_block_scale_factor: f64,
}

impl UnetConfigFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::resource(format!("{}", path.display()), e))?;
        serde_json::from_str(&content).map_err(|e| Error::resource(format!("{}", path.display()), e))
    }

    pub fn to_candle(&self) -> unet_2d::UNet2DConditionModelConfig {
        let blocks = self
            .block_out_channels
            .iter()
            .enumerate()
            .map(|(i, &out_channels)| {
                let cross_attn = self
                    .down_block_types
                    .get(i)
                    .map(|t| t.starts_with("CrossAttn"))
                    .unwrap_or(false);
                let layers = self.transformer_layers_per_block.as_ref().map(|l| l.get(i)).unwrap_or(1);
                unet_2d::BlockConfig {
                    out_channels,
                    use_cross_attn: cross_attn.then_some(layers),
                    attention_head_dim: self.attention_head_dim.get(i),
                }
            })
            .collect();

        unet_2d::UNet2DConditionModelConfig {
            blocks,
            center_input_sample: self.center_input_sample,
            cross_attention_dim: self.cross_attention_dim,
            downsample_padding: self.downsample_padding,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            layers_per_block: self.layers_per_block,
            mid_block_scale_factor: self.mid_block_scale_factor,
            norm_eps: self.norm_eps,
            norm_num_groups: self.norm_num_groups,
            use_linear_projection: self.use_linear_projection,
            sliced_attention_size: None,
        }
    }
}

/// UNet whose weights live in a `VarMap`, so every tensor is trainable.
pub struct SdUnet {
    inner: unet_2d::UNet2DConditionModel,
    varmap: VarMap,
}

impl SdUnet {
    /// Build the network and, unless `weights` is `None`, overwrite the fresh
    /// initialization with the pretrained tensors.
    pub fn new(config: &UnetConfigFile, weights: Option<&Path>, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let inner = unet_2d::UNet2DConditionModel::new(
            vb,
            config.in_channels,
            config.out_channels,
            false,
            config.to_candle(),
        )?;

        let unet = Self { inner, varmap };
        if let Some(path) = weights {
            unet.load_weights(path, device)?;
        }
        Ok(unet)
    }

    fn load_weights(&self, path: &Path, device: &Device) -> Result<()> {
        let mut tensors = candle_core::safetensors::load(path, device)
            .map_err(|e| Error::resource(format!("unet weights {}", path.display()), e))?;
        let mut loaded = 0usize;
        for (name, var) in self.named_parameters() {
            let tensor = tensors
                .remove(&name)
                .ok_or_else(|| Error::resource(format!("unet weights {}", path.display()), format!("missing tensor {name}")))?;
            var.set(&tensor.to_dtype(DType::F32)?)?;
            loaded += 1;
        }
        if !tensors.is_empty() {
            log::debug!("{} unused tensors in {}", tensors.len(), path.display());
        }
        log::info!("Loaded {loaded} UNet tensors from {}", path.display());
        Ok(())
    }
}

impl Denoiser for SdUnet {
    fn forward(&self, latents: &Tensor, timesteps: &[usize], context: &Tensor) -> Result<Tensor> {
        let batch_size = latents.dim(0)?;
        if timesteps.len() != batch_size {
            return Err(Error::configuration(format!(
                "{} timesteps for a batch of {batch_size}",
                timesteps.len()
            )));
        }

        // The candle UNet takes one timestep per call
        if timesteps.iter().all(|&t| t == timesteps[0]) {
            return Ok(self.inner.forward(latents, timesteps[0] as f64, context)?);
        }
        let outputs = timesteps
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let xs = latents.narrow(0, i, 1)?;
                let ctx = context.narrow(0, i, 1)?;
                self.inner.forward(&xs, t as f64, &ctx)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&outputs, 0)?)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(data) => data,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut params: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }
}

fn default_in_channels() -> usize {
    4
}

fn default_layers_per_block() -> usize {
    2
}

fn default_head_dim() -> PerBlock {
    PerBlock::Single(8)
}

fn default_norm_num_groups() -> usize {
    32
}

fn default_norm_eps() -> f64 {
    1e-5
}

fn default_true() -> bool {
    true
}

fn default_downsample_padding() -> usize {
    1
}

fn default_mid_block_scale_factor() -> f64 {
    1.0
}
