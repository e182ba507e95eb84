//! Diffusers-layout pretrained snapshot
//!
//! ```text
//! model_index.json
//! unet/{config.json, diffusion_pytorch_model.safetensors}
//! vae/{config.json, diffusion_pytorch_model.safetensors}
//! text_encoder/{config.json, model.safetensors}
//! tokenizer/tokenizer.json
//! scheduler/scheduler_config.json
//! ```

use anyhow::{anyhow, Context};
use candle_core::{DType, Device, Tensor};
use log::info;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{ComponentSource, SourceMetadata};
use crate::error::{Error, Result};
use crate::models::{clip_text, sd_unet::UnetConfigFile, sd_vae::VaeConfigFile, ClipTextConditioner, ModelEnsemble, SdAutoencoder, SdUnet};
use crate::trainers::checkpoint::write_safetensors;

const COMPONENTS: &[&str] = &["unet", "vae", "text_encoder", "tokenizer", "scheduler"];
const UNET_WEIGHTS: &str = "diffusion_pytorch_model.safetensors";

pub struct PretrainedSnapshot {
    root: PathBuf,
    unet_weights: PathBuf,
    vae_weights: PathBuf,
    text_encoder_weights: PathBuf,
}

impl PretrainedSnapshot {
    /// Check the layout up front so a broken snapshot fails before training.
    pub fn open(root: &Path) -> Result<Self> {
        Self::locate(root).map_err(|e| Error::resource(format!("pretrained model {}", root.display()), format!("{e:#}")))
    }

    fn locate(root: &Path) -> anyhow::Result<Self> {
        if !root.is_dir() {
            return Err(anyhow!("directory does not exist"));
        }
        let unet_weights = weights_file(root, "unet", "diffusion_pytorch_model")?;
        let vae_weights = weights_file(root, "vae", "diffusion_pytorch_model")?;
        let text_encoder_weights = weights_file(root, "text_encoder", "model")?;
        for required in ["unet/config.json", "vae/config.json", "text_encoder/config.json", "tokenizer/tokenizer.json"] {
            let path = root.join(required);
            if !path.is_file() {
                return Err(anyhow!("missing {required}"));
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            unet_weights,
            vae_weights,
            text_encoder_weights,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn weights_file(root: &Path, component: &str, stem: &str) -> anyhow::Result<PathBuf> {
    let dir = root.join(component);
    [format!("{stem}.safetensors"), format!("{stem}.fp16.safetensors")]
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .with_context(|| format!("no {stem}.safetensors in {}", dir.display()))
}

fn copy_tree(from: &Path, to: &Path, skip: &dyn Fn(&Path) -> bool) -> anyhow::Result<()> {
    fs::create_dir_all(to).with_context(|| format!("creating {}", to.display()))?;
    for entry in fs::read_dir(from).with_context(|| format!("reading {}", from.display()))? {
        let entry = entry?;
        let path = entry.path();
        if skip(&path) {
            continue;
        }
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&path, &target, skip)?;
        } else {
            fs::copy(&path, &target).with_context(|| format!("copying {}", path.display()))?;
        }
    }
    Ok(())
}

impl ComponentSource for PretrainedSnapshot {
    fn describe(&self) -> SourceMetadata {
        SourceMetadata {
            name: self
                .root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            location: self.root.display().to_string(),
            components: COMPONENTS
                .iter()
                .filter(|c| self.root.join(c).is_dir())
                .map(|c| c.to_string())
                .collect(),
        }
    }

    fn load(&self, device: &Device, weight_dtype: DType, denoiser_from_scratch: bool) -> Result<ModelEnsemble> {
        let root = &self.root;

        let text_config = clip_text::clip_preset(&root.join("text_encoder/config.json"))?;
        let text_conditioner = ClipTextConditioner::load(
            &text_config,
            &self.text_encoder_weights,
            &root.join("tokenizer/tokenizer.json"),
            weight_dtype,
            device,
        )?;
        info!("Loaded text encoder from {}", self.text_encoder_weights.display());

        let vae_config = VaeConfigFile::from_file(&root.join("vae/config.json"))?;
        let autoencoder = SdAutoencoder::load(&vae_config, &self.vae_weights, weight_dtype, device)?;
        info!("Loaded VAE from {}", self.vae_weights.display());

        let unet_config = UnetConfigFile::from_file(&root.join("unet/config.json"))?;
        let weights = (!denoiser_from_scratch).then_some(self.unet_weights.as_path());
        let denoiser = SdUnet::new(&unet_config, weights, device)?;
        if denoiser_from_scratch {
            info!("Initialized UNet from scratch");
        }

        Ok(ModelEnsemble::new(
            Box::new(denoiser),
            Box::new(autoencoder),
            Box::new(text_conditioner),
        ))
    }

    fn export_pipeline(&self, dest: &Path, denoiser_weights: &HashMap<String, Tensor>) -> Result<()> {
        let unet_dir = self.root.join("unet");
        let skip = |path: &Path| path.parent() == Some(unet_dir.as_path()) && path.extension().map(|e| e == "safetensors").unwrap_or(false);
        copy_tree(&self.root, dest, &skip)
            .map_err(|e| Error::checkpoint(format!("failed to copy pretrained pipeline: {e:#}")))?;

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "pt".to_string());
        write_safetensors(&dest.join("unet").join(UNET_WEIGHTS), denoiser_weights, metadata)
    }
}
