//! AdamW with decoupled weight decay
//! Moments can optionally be stored in 8-bit to reduce memory usage

use candle_core::{DType, Tensor, Var};
use std::collections::HashMap;

use super::OptimizerConfig;
use crate::error::{Error, Result};

/// 8-bit codes are offset by this value so they fit in an unsigned byte
const QOFFSET: f64 = 128.0;
const QMAX: f64 = 127.0;

/// Absmax-quantized tensor
#[derive(Clone)]
pub struct QuantizedTensor {
    pub data: Tensor, // u8 codes
    pub scale: f32,
}

impl QuantizedTensor {
    pub fn quantize(tensor: &Tensor) -> Result<Self> {
        let tensor = tensor.to_dtype(DType::F32)?;
        let abs_max = tensor.abs()?.max_all()?.to_scalar::<f32>()?;
        let scale = if abs_max > 0.0 { abs_max / QMAX as f32 } else { 1.0 };

        let codes = (tensor / scale as f64)?
            .round()?
            .clamp(-QMAX, QMAX)?
            .affine(1.0, QOFFSET)?
            .to_dtype(DType::U8)?;
        Ok(Self { data: codes, scale })
    }

    pub fn dequantize(&self) -> Result<Tensor> {
        let values = self
            .data
            .to_dtype(DType::F32)?
            .affine(self.scale as f64, -QOFFSET * self.scale as f64)?;
        Ok(values)
    }
}

#[derive(Clone)]
enum Moment {
    Full(Tensor),
    Quantized(QuantizedTensor),
}

impl Moment {
    fn store(tensor: Tensor, quantized: bool) -> Result<Self> {
        if quantized {
            Ok(Moment::Quantized(QuantizedTensor::quantize(&tensor)?))
        } else {
            Ok(Moment::Full(tensor))
        }
    }

    fn load(&self) -> Result<Tensor> {
        match self {
            Moment::Full(t) => Ok(t.clone()),
            Moment::Quantized(q) => q.dequantize(),
        }
    }
}

pub struct AdamW {
    params: Vec<(String, Var)>,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    use_8bit: bool,
    exp_avg: HashMap<String, Moment>,
    exp_avg_sq: HashMap<String, Moment>,
    step: usize,
}

impl AdamW {
    pub fn new(params: Vec<(String, Var)>, config: &OptimizerConfig) -> Self {
        Self {
            params,
            beta1: config.adam_beta1,
            beta2: config.adam_beta2,
            eps: config.adam_epsilon,
            weight_decay: config.adam_weight_decay,
            use_8bit: config.use_8bit_adam,
            exp_avg: HashMap::new(),
            exp_avg_sq: HashMap::new(),
            step: 0,
        }
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(name, _)| name.as_str())
    }

    /// Apply one update with learning rate `lr`. Parameters without a gradient are left alone.
    pub fn step(&mut self, grads: &HashMap<String, Tensor>, lr: f64) -> Result<()> {
        self.step += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.step as i32);

        for (name, param) in &self.params {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            let theta = param.as_tensor().to_dtype(DType::F32)?;

            let (m, v) = match (self.exp_avg.get(name), self.exp_avg_sq.get(name)) {
                (Some(m), Some(v)) => (m.load()?, v.load()?),
                _ => (grad.zeros_like()?, grad.zeros_like()?),
            };

            let m = ((m * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
            let v = ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&m / bias_correction1)?;
            let v_hat = (&v / bias_correction2)?;
            let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;

            // Decoupled weight decay
            let decayed = (theta * (1.0 - lr * self.weight_decay))?;
            let next = (decayed - (update * lr)?)?;
            param.set(&next.to_dtype(param.dtype())?)?;

            self.exp_avg.insert(name.clone(), Moment::store(m, self.use_8bit)?);
            self.exp_avg_sq.insert(name.clone(), Moment::store(v, self.use_8bit)?);
        }
        Ok(())
    }

    /// Moments keyed `<param>.exp_avg` and `<param>.exp_avg_sq`, always f32.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        for (name, m) in &self.exp_avg {
            tensors.insert(format!("{name}.exp_avg"), m.load()?);
        }
        for (name, v) in &self.exp_avg_sq {
            tensors.insert(format!("{name}.exp_avg_sq"), v.load()?);
        }
        Ok(tensors)
    }

    pub fn load_state_tensors(&mut self, tensors: HashMap<String, Tensor>, step: usize) -> Result<()> {
        let mut exp_avg = HashMap::new();
        let mut exp_avg_sq = HashMap::new();
        for (key, tensor) in tensors {
            let (name, slot) = if let Some(name) = key.strip_suffix(".exp_avg_sq") {
                (name.to_string(), &mut exp_avg_sq)
            } else if let Some(name) = key.strip_suffix(".exp_avg") {
                (name.to_string(), &mut exp_avg)
            } else {
                return Err(Error::checkpoint(format!("unexpected optimizer tensor {key}")));
            };
            let Some((_, param)) = self.params.iter().find(|(n, _)| *n == name) else {
                return Err(Error::checkpoint(format!("optimizer state for unknown parameter {name}")));
            };
            if tensor.dims() != param.dims() {
                return Err(Error::checkpoint(format!(
                    "optimizer state {key} has shape {:?}, parameter has {:?}",
                    tensor.dims(),
                    param.dims()
                )));
            }
            let tensor = tensor.to_device(param.device())?.to_dtype(DType::F32)?;
            slot.insert(name, Moment::store(tensor, self.use_8bit)?);
        }
        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        self.step = step;
        Ok(())
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut HashMap<String, Tensor>, max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for grad in grads.values() {
        total += grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
    }
    let norm = total.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for grad in grads.values_mut() {
            *grad = (&*grad * scale)?;
        }
    }
    Ok(norm)
}
