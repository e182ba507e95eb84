//! Frozen CLIP tokenizer and text encoder

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip;
use serde::Deserialize;
use std::path::Path;
use tokenizers::Tokenizer;

use super::TextConditioner;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
struct TextEncoderConfigFile {
    hidden_size: usize,
}

/// Pick the candle preset matching a `text_encoder/config.json`.
pub fn clip_preset(config_path: &Path) -> Result<clip::Config> {
    let what = || format!("text encoder config {}", config_path.display());
    let content = std::fs::read_to_string(config_path).map_err(|e| Error::resource(what(), e))?;
    let config: TextEncoderConfigFile = serde_json::from_str(&content).map_err(|e| Error::resource(what(), e))?;
    match config.hidden_size {
        768 => Ok(clip::Config::v1_5()),
        1024 => Ok(clip::Config::v2_1()),
        other => Err(Error::resource(what(), format!("unsupported hidden size {other}"))),
    }
}

pub struct ClipTextConditioner {
    tokenizer: Tokenizer,
    encoder: clip::ClipTextTransformer,
    max_length: usize,
    pad_id: u32,
    device: Device,
}

impl ClipTextConditioner {
    pub fn load(config: &clip::Config, weights: &Path, tokenizer: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(|e| Error::resource(format!("tokenizer {}", tokenizer.display()), e))?;

        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .get_vocab(true)
            .get(pad_token)
            .copied()
            .ok_or_else(|| Error::resource("tokenizer", format!("no id for padding token {pad_token}")))?;

        let tensors = candle_core::safetensors::load(weights, device)
            .map_err(|e| Error::resource(format!("text encoder weights {}", weights.display()), e))?;
        let vb = VarBuilder::from_tensors(tensors, dtype, device);
        let encoder = clip::ClipTextTransformer::new(vb, config)?;

        Ok(Self {
            tokenizer,
            encoder,
            max_length: config.max_position_embeddings,
            pad_id,
            device: device.clone(),
        })
    }

    fn token_ids(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::resource("tokenizer", e))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(self.max_length);
        ids.resize(self.max_length, self.pad_id);
        Ok(ids)
    }
}

impl TextConditioner for ClipTextConditioner {
    fn encode(&self, prompts: &[String]) -> Result<Tensor> {
        let rows = prompts
            .iter()
            .map(|p| Ok(Tensor::new(self.token_ids(p)?.as_slice(), &self.device)?))
            .collect::<Result<Vec<_>>>()?;
        let ids = Tensor::stack(&rows, 0)?;
        let hidden = self.encoder.forward(&ids)?;
        Ok(hidden.to_dtype(DType::F32)?)
    }
}
