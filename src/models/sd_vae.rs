//! Frozen Stable Diffusion VAE

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::vae;
use serde::Deserialize;
use std::path::Path;

use super::Autoencoder;
use crate::error::{Error, Result};

/// Subset of a diffusers `vae/config.json`
#[derive(Debug, Clone, Deserialize)]
pub struct VaeConfigFile {
    pub block_out_channels: Vec<usize>,
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f64,
    #[serde(default = "default_true")]
    pub use_quant_conv: bool,
    #[serde(default = "default_true")]
    pub use_post_quant_conv: bool,
}

impl VaeConfigFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::resource(format!("{}", path.display()), e))?;
        serde_json::from_str(&content).map_err(|e| Error::resource(format!("{}", path.display()), e))
    }
}

pub struct SdAutoencoder {
    inner: vae::AutoEncoderKL,
    dtype: DType,
    scaling_factor: f64,
    latent_channels: usize,
    downscale_factor: usize,
}

impl SdAutoencoder {
    pub fn load(config: &VaeConfigFile, weights: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(weights, device)
            .map_err(|e| Error::resource(format!("vae weights {}", weights.display()), e))?;
        let vb = VarBuilder::from_tensors(tensors, dtype, device);

        let inner = vae::AutoEncoderKL::new(
            vb,
            3,
            3,
            vae::AutoEncoderKLConfig {
                block_out_channels: config.block_out_channels.clone(),
                layers_per_block: config.layers_per_block,
                latent_channels: config.latent_channels,
                norm_num_groups: config.norm_num_groups,
                use_quant_conv: config.use_quant_conv,
                use_post_quant_conv: config.use_post_quant_conv,
            },
        )?;

        Ok(Self {
            inner,
            dtype,
            scaling_factor: config.scaling_factor,
            latent_channels: config.latent_channels,
            downscale_factor: 1 << config.block_out_channels.len().saturating_sub(1),
        })
    }
}

impl Autoencoder for SdAutoencoder {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let dist = self.inner.encode(&images.to_dtype(self.dtype)?)?;
        let latents = (dist.sample()? * self.scaling_factor)?;
        Ok(latents.to_dtype(DType::F32)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents / self.scaling_factor)?.to_dtype(self.dtype)?;
        let images = self.inner.decode(&latents)?;
        Ok(images.to_dtype(DType::F32)?.clamp(-1f32, 1f32)?)
    }

    fn latent_channels(&self) -> usize {
        self.latent_channels
    }

    fn downscale_factor(&self) -> usize {
        self.downscale_factor
    }
}

fn default_layers_per_block() -> usize {
    2
}

fn default_latent_channels() -> usize {
    4
}

fn default_norm_num_groups() -> usize {
    32
}

fn default_scaling_factor() -> f64 {
    0.18215
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_factor_defaults_to_sd_value() {
        let config: VaeConfigFile =
            serde_json::from_str(r#"{"block_out_channels": [128, 256, 512, 512]}"#).unwrap();
        assert_eq!(config.scaling_factor, 0.18215);
        assert_eq!(config.latent_channels, 4);
        assert!(config.use_quant_conv);
    }
}
