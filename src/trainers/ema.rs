//! Exponential moving average of the denoiser weights

use candle_core::{Tensor, Var};
use std::collections::HashMap;

use super::EmaConfig;
use crate::error::{Error, Result};

pub struct EmaModel {
    config: EmaConfig,
    shadow: Vec<(String, Tensor)>,
    backup: Option<Vec<Tensor>>,
    optimization_step: usize,
}

impl EmaModel {
    /// Start the shadow as a copy of the current parameters.
    pub fn new(params: &[(String, Var)], config: &EmaConfig) -> Result<Self> {
        let shadow = params
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().detach().copy()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config: config.clone(),
            shadow,
            backup: None,
            optimization_step: 0,
        })
    }

    pub fn optimization_step(&self) -> usize {
        self.optimization_step
    }

    /// Decay applied at a given optimization step, with warmup.
    pub fn get_decay(&self, optimization_step: usize) -> f64 {
        let step = optimization_step.saturating_sub(self.config.update_after_step + 1);
        if step == 0 {
            return 0.0;
        }
        let decay = 1.0 - (1.0 + step as f64 / self.config.inv_gamma).powf(-self.config.power);
        decay.min(self.config.max_decay).max(self.config.min_decay)
    }

    /// Fold the current parameters into the shadow. Call once per optimizer update.
    pub fn step(&mut self, params: &[(String, Var)]) -> Result<()> {
        self.check_params(params)?;
        self.optimization_step += 1;
        let one_minus_decay = 1.0 - self.get_decay(self.optimization_step);

        for ((_, shadow), (_, param)) in self.shadow.iter_mut().zip(params) {
            let param = param.as_tensor().detach().to_dtype(shadow.dtype())?;
            let delta = ((&*shadow - &param)? * one_minus_decay)?;
            *shadow = (&*shadow - delta)?;
        }
        Ok(())
    }

    /// Keep a copy of the live parameters so they can be put back after sampling.
    pub fn store(&mut self, params: &[(String, Var)]) -> Result<()> {
        let backup = params
            .iter()
            .map(|(_, var)| Ok(var.as_tensor().detach().copy()?))
            .collect::<Result<Vec<_>>>()?;
        self.backup = Some(backup);
        Ok(())
    }

    /// Overwrite the live parameters with the shadow weights.
    pub fn copy_to(&self, params: &[(String, Var)]) -> Result<()> {
        self.check_params(params)?;
        for ((_, shadow), (_, var)) in self.shadow.iter().zip(params) {
            var.set(&shadow.to_dtype(var.dtype())?)?;
        }
        Ok(())
    }

    pub fn restore(&mut self, params: &[(String, Var)]) -> Result<()> {
        let backup = self
            .backup
            .take()
            .ok_or_else(|| Error::checkpoint("EMA restore called without a stored copy"))?;
        for (saved, (_, var)) in backup.iter().zip(params) {
            var.set(saved)?;
        }
        Ok(())
    }

    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        self.shadow.iter().cloned().collect()
    }

    pub fn load_state_tensors(&mut self, mut tensors: HashMap<String, Tensor>, optimization_step: usize) -> Result<()> {
        for (name, shadow) in self.shadow.iter_mut() {
            let loaded = tensors
                .remove(name)
                .ok_or_else(|| Error::checkpoint(format!("EMA state is missing {name}")))?;
            if loaded.dims() != shadow.dims() {
                return Err(Error::checkpoint(format!(
                    "EMA tensor {name} has shape {:?}, expected {:?}",
                    loaded.dims(),
                    shadow.dims()
                )));
            }
            *shadow = loaded.to_device(shadow.device())?.to_dtype(shadow.dtype())?;
        }
        if let Some(extra) = tensors.keys().next() {
            return Err(Error::checkpoint(format!("EMA state has unknown tensor {extra}")));
        }
        self.optimization_step = optimization_step;
        Ok(())
    }

    fn check_params(&self, params: &[(String, Var)]) -> Result<()> {
        let matches = params.len() == self.shadow.len()
            && params.iter().zip(&self.shadow).all(|((a, _), (b, _))| a == b);
        if matches {
            Ok(())
        } else {
            Err(Error::checkpoint("EMA shadow does not match the denoiser parameters"))
        }
    }
}
