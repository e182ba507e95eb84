mod common;

use candle_core::{Device, Tensor};
use std::collections::HashMap;

use common::{config, MemoryDataset, ToySource};
use latent_tuner::loaders::ComponentSource;
use latent_tuner::models::ModelEnsemble;
use latent_tuner::trainers::checkpoint::{RestoreTarget, SaveRequest, TrainingState};
use latent_tuner::trainers::data_loader::{DataLoader, EpochSampler};
use latent_tuner::trainers::distributed::SingleProcess;
use latent_tuner::trainers::ema::EmaModel;
use latent_tuner::trainers::epoch::{EpochDriver, Trainables};
use latent_tuner::trainers::lr_scheduler::LrScheduler;
use latent_tuner::trainers::noise_scheduler::NoiseScheduler;
use latent_tuner::trainers::optimizer::AdamW;
use latent_tuner::trainers::orchestrator::{OutputLayout, RunContext};
use latent_tuner::trainers::tracker::Monitor;
use latent_tuner::trainers::{CheckpointManager, ResumePlan, RunConfig, TrainingSetup};

struct Training {
    ensemble: ModelEnsemble,
    optimizer: AdamW,
    scheduler: LrScheduler,
}

fn training(source: &ToySource, cfg: &RunConfig) -> Training {
    let mut ensemble = source.ensemble(&Device::Cpu);
    let params = ensemble.trainable_parameters().to_vec();
    if cfg.ema.enabled {
        ensemble.ema = Some(EmaModel::new(&params, &cfg.ema).unwrap());
    }
    Training {
        optimizer: AdamW::new(params, &cfg.optimizer),
        scheduler: LrScheduler::new(&cfg.lr_scheduler, cfg.optimizer.learning_rate, 100),
        ensemble,
    }
}

/// Fake optimizer updates with deterministic gradients.
fn take_steps(t: &mut Training, steps: usize) {
    for s in 0..steps {
        let grads: HashMap<String, Tensor> = t
            .ensemble
            .trainable_parameters()
            .iter()
            .map(|(name, var)| (name.clone(), (var.ones_like().unwrap() * (0.1 * (s + 1) as f64)).unwrap()))
            .collect();
        let lr = t.scheduler.step();
        t.optimizer.step(&grads, lr).unwrap();
        let params = t.ensemble.trainable_parameters().to_vec();
        if let Some(ema) = t.ensemble.ema.as_mut() {
            ema.step(&params).unwrap();
        }
    }
}

fn save(manager: &CheckpointManager, t: &Training, source: &ToySource, global_step: usize) {
    manager
        .save(SaveRequest {
            state: TrainingState {
                global_step,
                epoch: global_step / 5,
                resume_step: global_step % 5,
            },
            params: t.ensemble.trainable_parameters(),
            ema: t.ensemble.ema.as_ref(),
            optimizer: &t.optimizer,
            scheduler: &t.scheduler,
            pretrained: source.describe(),
        })
        .unwrap();
}

fn values(map: &HashMap<String, Tensor>) -> Vec<(String, Vec<f32>)> {
    let mut entries: Vec<_> = map
        .iter()
        .map(|(k, v)| (k.clone(), v.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

#[test]
fn retention_keeps_the_newest_records() {
    let dir = tempfile::tempdir().unwrap();
    let source = ToySource::default();
    let cfg = config(dir.path(), 1, 2, 1);
    let t = training(&source, &cfg);
    let manager = CheckpointManager::new(dir.path(), Some(3));

    for step in 1..=4 {
        save(&manager, &t, &source, step);
    }

    let steps: Vec<_> = manager.list().unwrap().iter().map(|r| r.manifest.global_step).collect();
    assert_eq!(steps, vec![2, 3, 4]);
    assert!(!dir.path().join("checkpoints/checkpoint-1").exists());
    // No staging directories are left behind
    let hidden = std::fs::read_dir(manager.checkpoints_dir())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
        .count();
    assert_eq!(hidden, 0);
}

fn checkpoint_entries(manager: &CheckpointManager) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(manager.checkpoints_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn failed_save_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let source = ToySource::default();
    let cfg = config(dir.path(), 1, 2, 1);
    let t = training(&source, &cfg);
    let manager = CheckpointManager::new(dir.path(), None);

    let err = manager
        .save(SaveRequest {
            state: TrainingState {
                global_step: 4,
                epoch: 0,
                resume_step: 4,
            },
            params: &[],
            ema: None,
            optimizer: &t.optimizer,
            scheduler: &t.scheduler,
            pretrained: source.describe(),
        })
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(checkpoint_entries(&manager).is_empty());
    assert!(manager.latest().unwrap().is_none());
}

#[test]
fn saving_the_same_step_again_replaces_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let source = ToySource::default();
    let cfg = config(dir.path(), 1, 2, 1);
    let mut t = training(&source, &cfg);
    let manager = CheckpointManager::new(dir.path(), None);

    save(&manager, &t, &source, 2);
    take_steps(&mut t, 2);
    save(&manager, &t, &source, 2);

    assert_eq!(checkpoint_entries(&manager), vec!["checkpoint-2"]);
    let record = manager.latest().unwrap().unwrap();
    assert_eq!(record.manifest.optimizer_step, 2);
    let saved = candle_core::safetensors::load(record.directory.join("denoiser.safetensors"), &Device::Cpu).unwrap();
    assert_eq!(values(&saved), values(&t.ensemble.denoiser_weights()));
}

#[test]
fn save_then_restore_is_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let source = ToySource::default();
    let mut cfg = config(dir.path(), 1, 2, 1);
    cfg.ema.enabled = true;

    let mut trained = training(&source, &cfg);
    take_steps(&mut trained, 3);
    let manager = CheckpointManager::new(dir.path(), None);
    save(&manager, &trained, &source, 3);

    let mut fresh = training(&source, &cfg);
    assert_ne!(
        values(&fresh.ensemble.denoiser_weights()),
        values(&trained.ensemble.denoiser_weights())
    );

    let record = manager.latest().unwrap().unwrap();
    let params = fresh.ensemble.trainable_parameters().to_vec();
    let state = manager
        .restore(
            &record,
            RestoreTarget {
                params: &params,
                ema: fresh.ensemble.ema.as_mut(),
                optimizer: &mut fresh.optimizer,
                scheduler: &mut fresh.scheduler,
            },
        )
        .unwrap();

    assert_eq!(state, TrainingState { global_step: 3, epoch: 0, resume_step: 3 });
    assert_eq!(values(&fresh.ensemble.denoiser_weights()), values(&trained.ensemble.denoiser_weights()));
    assert_eq!(values(&fresh.ensemble.export_weights()), values(&trained.ensemble.export_weights()));
    assert_eq!(
        values(&fresh.optimizer.state_tensors().unwrap()),
        values(&trained.optimizer.state_tensors().unwrap())
    );
    assert_eq!(fresh.optimizer.step_count(), 3);
    assert_eq!(fresh.scheduler.state(), trained.scheduler.state());
    assert_eq!(fresh.ensemble.ema.as_ref().unwrap().optimization_step(), 3);

    // Both continue identically
    take_steps(&mut trained, 1);
    take_steps(&mut fresh, 1);
    assert_eq!(values(&fresh.ensemble.denoiser_weights()), values(&trained.ensemble.denoiser_weights()));
}

#[test]
fn enabling_ema_on_a_checkpoint_without_it_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let source = ToySource::default();
    let cfg = config(dir.path(), 1, 2, 1);
    let trained = training(&source, &cfg);
    let manager = CheckpointManager::new(dir.path(), None);
    save(&manager, &trained, &source, 1);

    let mut ema_cfg = cfg.clone();
    ema_cfg.ema.enabled = true;
    let mut fresh = training(&source, &ema_cfg);
    let params = fresh.ensemble.trainable_parameters().to_vec();
    let err = manager
        .restore(
            &manager.latest().unwrap().unwrap(),
            RestoreTarget {
                params: &params,
                ema: fresh.ensemble.ema.as_mut(),
                optimizer: &mut fresh.optimizer,
                scheduler: &mut fresh.scheduler,
            },
        )
        .unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn resumed_epoch_skips_consumed_batches_without_computing_them() {
    let dir = tempfile::tempdir().unwrap();
    let source = ToySource::default();
    let dataset = MemoryDataset::new(10);
    let cfg = config(dir.path(), 2, 2, 1);
    let mut t = training(&source, &cfg);

    let setup = TrainingSetup::compute(10, 2, 1, 1, 2, 2, 0).unwrap();
    let noise_scheduler = NoiseScheduler::new(&cfg.noise_scheduler).unwrap();
    let driver = EpochDriver::new(&setup, &noise_scheduler, Some(1.0), 1);
    let loader = DataLoader::new(&dataset, EpochSampler::new(10, 2, 1, 0, 7, true), &cfg.dataset).unwrap();

    let group = SingleProcess;
    let mut ctx = RunContext::new(&group, Device::Cpu, 7, Monitor::disabled(), OutputLayout::new(dir.path()));

    // Two of five updates of epoch 1 were already taken
    let plan = ResumePlan::from_global_step(7, setup.num_update_steps_per_epoch, 1);
    assert_eq!((plan.first_epoch, plan.resume_step, plan.skip_batches), (1, 2, 2));

    let outcome = driver
        .run_epoch(
            &mut ctx,
            &loader,
            1,
            &plan,
            plan.global_step,
            Trainables {
                ensemble: &mut t.ensemble,
                optimizer: &mut t.optimizer,
                lr_scheduler: &mut t.scheduler,
            },
        )
        .unwrap();

    assert_eq!(outcome.skipped_batches, 2);
    assert_eq!(outcome.updates, 3);
    assert_eq!(outcome.global_step, 10);
    assert_eq!(source.forward_passes(), 3);
    assert!(outcome.mean_loss.unwrap() > 0.0);

    // The following epoch runs in full
    let outcome = driver
        .run_epoch(
            &mut ctx,
            &loader,
            2,
            &plan,
            outcome.global_step,
            Trainables {
                ensemble: &mut t.ensemble,
                optimizer: &mut t.optimizer,
                lr_scheduler: &mut t.scheduler,
            },
        )
        .unwrap();
    assert_eq!(outcome.skipped_batches, 0);
    assert_eq!(outcome.global_step, 15);
    assert_eq!(source.forward_passes(), 8);
}

#[test]
fn ema_shadow_only_moves_on_optimizer_updates() {
    let dir = tempfile::tempdir().unwrap();
    let source = ToySource::default();
    let dataset = MemoryDataset::new(8);
    let mut cfg = config(dir.path(), 1, 2, 4);
    cfg.ema.enabled = true;
    let mut t = training(&source, &cfg);

    // Four micro-batches close exactly one accumulation window
    let setup = TrainingSetup::compute(8, 2, 1, 4, 2, 2, 0).unwrap();
    let noise_scheduler = NoiseScheduler::new(&cfg.noise_scheduler).unwrap();
    let driver = EpochDriver::new(&setup, &noise_scheduler, None, 1);
    let loader = DataLoader::new(&dataset, EpochSampler::new(8, 2, 1, 0, 7, false), &cfg.dataset).unwrap();
    let group = SingleProcess;
    let mut ctx = RunContext::new(&group, Device::Cpu, 7, Monitor::disabled(), OutputLayout::new(dir.path()));

    let outcome = driver
        .run_epoch(
            &mut ctx,
            &loader,
            0,
            &ResumePlan::fresh(),
            0,
            Trainables {
                ensemble: &mut t.ensemble,
                optimizer: &mut t.optimizer,
                lr_scheduler: &mut t.scheduler,
            },
        )
        .unwrap();

    assert_eq!(source.forward_passes(), 4);
    assert_eq!(outcome.updates, 1);
    assert_eq!(t.optimizer.step_count(), 1);
    assert_eq!(t.ensemble.ema.as_ref().unwrap().optimization_step(), 1);
}
