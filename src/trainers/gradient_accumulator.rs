//! Gradient accumulation across micro-batches

use candle_core::{backprop::GradStore, Tensor, Var};
use std::collections::HashMap;

use crate::error::Result;

/// Sums per-parameter gradients until the next optimizer update.
#[derive(Default)]
pub struct GradientAccumulator {
    accumulated_grads: HashMap<String, Tensor>,
    micro_batches: usize,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        let grad = grad.detach();
        if let Some(acc) = self.accumulated_grads.get_mut(name) {
            *acc = (&*acc + grad)?;
        } else {
            self.accumulated_grads.insert(name.to_string(), grad);
        }
        Ok(())
    }

    /// Pull the gradients of `params` out of a backward pass.
    pub fn accumulate_from(&mut self, params: &[(String, Var)], grads: &GradStore) -> Result<()> {
        for (name, var) in params {
            if let Some(grad) = grads.get(var.as_tensor()) {
                self.accumulate(name, grad)?;
            }
        }
        self.micro_batches += 1;
        Ok(())
    }

    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    pub fn is_empty(&self) -> bool {
        self.accumulated_grads.is_empty()
    }

    pub fn get_and_reset(&mut self) -> HashMap<String, Tensor> {
        self.micro_batches = 0;
        std::mem::take(&mut self.accumulated_grads)
    }
}
