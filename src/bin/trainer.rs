use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use latent_tuner::loaders::PretrainedSnapshot;
use latent_tuner::trainers::data_loader::ImageFolderDataset;
use latent_tuner::trainers::{ConfigOverrides, MixedPrecision};

/// Fine-tune a latent diffusion model on a class-labelled image folder.
#[derive(Parser, Debug)]
#[command(name = "trainer", version)]
struct Args {
    /// YAML run configuration
    config: PathBuf,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Checkpoint to resume from: `latest`, a checkpoint name, or a path
    #[arg(long)]
    resume: Option<String>,

    #[arg(long)]
    num_epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// no, fp16 or bf16
    #[arg(long, value_parser = parse_precision)]
    mixed_precision: Option<MixedPrecision>,
}

fn parse_precision(value: &str) -> std::result::Result<MixedPrecision, String> {
    match value.to_ascii_lowercase().as_str() {
        "no" => Ok(MixedPrecision::No),
        "fp16" => Ok(MixedPrecision::Fp16),
        "bf16" => Ok(MixedPrecision::Bf16),
        other => Err(format!("unknown precision '{other}', expected no, fp16 or bf16")),
    }
}

fn main() -> Result<()> {
    latent_tuner::logging::init_logger();
    let args = Args::parse();

    let mut config = latent_tuner::load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.apply_overrides(&ConfigOverrides {
        output_dir: args.output_dir,
        resume_from_checkpoint: args.resume,
        num_epochs: args.num_epochs,
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        mixed_precision: args.mixed_precision,
    });
    config.validate()?;

    info!("Starting trainer with config: {}", args.config.display());
    let dataset = ImageFolderDataset::open(&config.dataset)?;
    let source = PretrainedSnapshot::open(&config.model.pretrained_path)?;

    let summary = latent_tuner::launch(&config, &source, &dataset)?;
    info!(
        "Training completed at global step {} ({} epochs run, {} checkpoints kept)",
        summary.global_step,
        summary.epochs_run,
        summary.checkpoints.len()
    );
    Ok(())
}
