//! Pretrained component loading and pipeline export

pub mod pretrained;

pub use pretrained::PretrainedSnapshot;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::models::ModelEnsemble;

/// Enough about the pretrained source to rebuild an inference pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub name: String,
    pub location: String,
    pub components: Vec<String>,
}

/// Where the autoencoder, denoiser and text conditioner come from.
pub trait ComponentSource: Sync {
    fn describe(&self) -> SourceMetadata;

    /// Instantiate every component. Frozen parts use `weight_dtype`, the
    /// denoiser always keeps f32 weights. With `denoiser_from_scratch` the
    /// denoiser is freshly initialized instead of loaded.
    fn load(&self, device: &Device, weight_dtype: DType, denoiser_from_scratch: bool) -> Result<ModelEnsemble>;

    /// Write a standalone pipeline into the empty directory `dest`, using
    /// `denoiser_weights` in place of the pretrained denoiser.
    fn export_pipeline(&self, dest: &Path, denoiser_weights: &HashMap<String, Tensor>) -> Result<()>;
}
