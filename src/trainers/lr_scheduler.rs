//! Learning rate schedules, stepped once per optimizer update

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::{LrScheduleKind, LrSchedulerConfig};

/// Learning rate as a function of the number of completed updates
pub trait LrSchedule: Send + Sync {
    fn get_lr(&self, step: usize) -> f64;
}

/// Build the schedule named in the config over `total_steps` updates.
pub fn create_schedule(config: &LrSchedulerConfig, base_lr: f64, total_steps: usize) -> Box<dyn LrSchedule> {
    let warmup = Warmup {
        base_lr,
        warmup_steps: config.warmup_steps,
    };
    match config.kind {
        LrScheduleKind::Constant => Box::new(ConstantSchedule { lr: base_lr }),
        LrScheduleKind::ConstantWithWarmup => Box::new(ConstantWithWarmupSchedule { warmup }),
        LrScheduleKind::Linear => Box::new(LinearSchedule { warmup, total_steps }),
        LrScheduleKind::Cosine => Box::new(CosineSchedule {
            warmup,
            total_steps,
            num_cycles: 0.5,
            hard_restarts: false,
        }),
        LrScheduleKind::CosineWithRestarts => Box::new(CosineSchedule {
            warmup,
            total_steps,
            num_cycles: config.num_cycles as f64,
            hard_restarts: true,
        }),
        LrScheduleKind::Polynomial => Box::new(PolynomialSchedule {
            warmup,
            total_steps,
            power: config.power,
            lr_end: config.lr_end,
        }),
    }
}

#[derive(Clone, Copy)]
struct Warmup {
    base_lr: f64,
    warmup_steps: usize,
}

impl Warmup {
    fn factor(&self, step: usize) -> Option<f64> {
        (step < self.warmup_steps).then(|| step as f64 / self.warmup_steps.max(1) as f64)
    }

    fn progress(&self, step: usize, total_steps: usize) -> f64 {
        (step - self.warmup_steps) as f64 / total_steps.saturating_sub(self.warmup_steps).max(1) as f64
    }
}

struct ConstantSchedule {
    lr: f64,
}

impl LrSchedule for ConstantSchedule {
    fn get_lr(&self, _step: usize) -> f64 {
        self.lr
    }
}

struct ConstantWithWarmupSchedule {
    warmup: Warmup,
}

impl LrSchedule for ConstantWithWarmupSchedule {
    fn get_lr(&self, step: usize) -> f64 {
        self.warmup.base_lr * self.warmup.factor(step).unwrap_or(1.0)
    }
}

struct LinearSchedule {
    warmup: Warmup,
    total_steps: usize,
}

impl LrSchedule for LinearSchedule {
    fn get_lr(&self, step: usize) -> f64 {
        let factor = self
            .warmup
            .factor(step)
            .unwrap_or_else(|| (1.0 - self.warmup.progress(step, self.total_steps)).max(0.0));
        self.warmup.base_lr * factor
    }
}

struct CosineSchedule {
    warmup: Warmup,
    total_steps: usize,
    num_cycles: f64,
    hard_restarts: bool,
}

impl LrSchedule for CosineSchedule {
    fn get_lr(&self, step: usize) -> f64 {
        let factor = self.warmup.factor(step).unwrap_or_else(|| {
            let progress = self.warmup.progress(step, self.total_steps);
            if self.hard_restarts {
                if progress >= 1.0 {
                    0.0
                } else {
                    0.5 * (1.0 + (PI * ((self.num_cycles * progress) % 1.0)).cos())
                }
            } else {
                (0.5 * (1.0 + (PI * self.num_cycles * 2.0 * progress).cos())).max(0.0)
            }
        });
        self.warmup.base_lr * factor
    }
}

struct PolynomialSchedule {
    warmup: Warmup,
    total_steps: usize,
    power: f64,
    lr_end: f64,
}

impl LrSchedule for PolynomialSchedule {
    fn get_lr(&self, step: usize) -> f64 {
        let base_lr = self.warmup.base_lr;
        if let Some(factor) = self.warmup.factor(step) {
            return base_lr * factor;
        }
        if step > self.total_steps {
            return self.lr_end;
        }
        let remaining = 1.0 - self.warmup.progress(step, self.total_steps);
        (base_lr - self.lr_end) * remaining.max(0.0).powf(self.power) + self.lr_end
    }
}

/// Serializable scheduler progress
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SchedulerState {
    pub step: usize,
    pub last_lr: f64,
}

/// A schedule plus the number of updates already taken.
pub struct LrScheduler {
    schedule: Box<dyn LrSchedule>,
    step: usize,
    last_lr: f64,
}

impl LrScheduler {
    pub fn new(config: &LrSchedulerConfig, base_lr: f64, total_steps: usize) -> Self {
        let schedule = create_schedule(config, base_lr, total_steps);
        let last_lr = schedule.get_lr(0);
        Self {
            schedule,
            step: 0,
            last_lr,
        }
    }

    /// Learning rate for the next update, then advance.
    pub fn step(&mut self) -> f64 {
        self.last_lr = self.schedule.get_lr(self.step);
        self.step += 1;
        self.last_lr
    }

    pub fn last_lr(&self) -> f64 {
        self.last_lr
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            step: self.step,
            last_lr: self.last_lr,
        }
    }

    pub fn load_state(&mut self, state: SchedulerState) {
        self.step = state.step;
        self.last_lr = state.last_lr;
    }
}
