//! Component seams for latent diffusion models
//!
//! The training core only talks to these traits. The Stable Diffusion
//! adapters below wrap the candle-transformers implementations.

pub mod clip_text;
pub mod sd_unet;
pub mod sd_vae;

pub use clip_text::ClipTextConditioner;
pub use sd_unet::SdUnet;
pub use sd_vae::SdAutoencoder;

use candle_core::{Tensor, Var};
use std::collections::HashMap;

use crate::error::Result;
use crate::trainers::ema::EmaModel;

/// Trainable network predicting the diffusion target.
pub trait Denoiser {
    /// `latents` is `[B, C, h, w]`, `timesteps` has one entry per batch element,
    /// `context` is the text conditioning `[B, seq, dim]`.
    fn forward(&self, latents: &Tensor, timesteps: &[usize], context: &Tensor) -> Result<Tensor>;

    /// Trainable weights sorted by name.
    fn named_parameters(&self) -> Vec<(String, Var)>;
}

/// Frozen image autoencoder
pub trait Autoencoder {
    /// Images in [-1, 1] to scaled latents.
    fn encode(&self, images: &Tensor) -> Result<Tensor>;

    /// Scaled latents back to images in [-1, 1].
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    fn latent_channels(&self) -> usize;

    fn downscale_factor(&self) -> usize;
}

/// Frozen tokenizer and text encoder
pub trait TextConditioner {
    fn encode(&self, prompts: &[String]) -> Result<Tensor>;
}

/// The trainable denoiser, the frozen components and the optional EMA shadow.
pub struct ModelEnsemble {
    pub denoiser: Box<dyn Denoiser>,
    pub autoencoder: Box<dyn Autoencoder>,
    pub text_conditioner: Box<dyn TextConditioner>,
    pub ema: Option<EmaModel>,
    params: Vec<(String, Var)>,
}

impl ModelEnsemble {
    pub fn new(
        denoiser: Box<dyn Denoiser>,
        autoencoder: Box<dyn Autoencoder>,
        text_conditioner: Box<dyn TextConditioner>,
    ) -> Self {
        let mut params = denoiser.named_parameters();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            denoiser,
            autoencoder,
            text_conditioner,
            ema: None,
            params,
        }
    }

    pub fn trainable_parameters(&self) -> &[(String, Var)] {
        &self.params
    }

    pub fn num_trainable_parameters(&self) -> usize {
        self.params.iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Current denoiser weights.
    pub fn denoiser_weights(&self) -> HashMap<String, Tensor> {
        self.params
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    }

    /// Weights to publish: the EMA shadow when enabled, otherwise the live ones.
    pub fn export_weights(&self) -> HashMap<String, Tensor> {
        match &self.ema {
            Some(ema) => ema.state_tensors(),
            None => self.denoiser_weights(),
        }
    }
}
