//! Data-parallel process groups
//!
//! `LocalGroup` runs one replica per thread inside a single process. All
//! collective calls must be made by every rank in the same order. A failing
//! rank calls `abort`, which wakes every peer blocked in a collective with a
//! `Distributed` error instead of leaving it waiting forever.

use candle_core::{Device, Tensor, Var};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every rank has arrived.
    fn barrier(&self) -> Result<()>;

    /// Replace every gradient by its mean over all ranks.
    fn all_reduce_mean(&self, grads: &mut HashMap<String, Tensor>) -> Result<()>;

    /// Overwrite every rank's parameters with the coordinator's values.
    fn broadcast_parameters(&self, params: &[(String, Var)]) -> Result<()>;

    /// Mark the group as failed so peers stop waiting.
    fn abort(&self, reason: &str);
}

/// The trivial group of one
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_reduce_mean(&self, _grads: &mut HashMap<String, Tensor>) -> Result<()> {
        Ok(())
    }

    fn broadcast_parameters(&self, _params: &[(String, Var)]) -> Result<()> {
        Ok(())
    }

    fn abort(&self, _reason: &str) {}
}

struct BarrierState {
    arrived: usize,
    generation: u64,
    poisoned: Option<String>,
}

struct Shared {
    world_size: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
    slots: Mutex<Vec<Option<HashMap<String, Tensor>>>>,
}

/// Handle of one rank in an in-process group
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// One handle per rank, in rank order.
    pub fn create(world_size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            world_size,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                poisoned: None,
            }),
            cvar: Condvar::new(),
            slots: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }

    fn state(&self) -> Result<MutexGuard<'_, BarrierState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| Error::distributed("process group state lock poisoned"))
    }

    fn slots(&self) -> Result<MutexGuard<'_, Vec<Option<HashMap<String, Tensor>>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| Error::distributed("process group slots lock poisoned"))
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<()> {
        let mut state = self.state()?;
        if let Some(reason) = &state.poisoned {
            return Err(Error::distributed(format!("peer failed: {reason}")));
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.shared.world_size {
            state.arrived = 0;
            state.generation += 1;
            self.shared.cvar.notify_all();
            return Ok(());
        }

        while state.generation == generation && state.poisoned.is_none() {
            state = self
                .shared
                .cvar
                .wait(state)
                .map_err(|_| Error::distributed("process group state lock poisoned"))?;
        }
        if state.generation == generation {
            let reason = state.poisoned.clone().unwrap_or_default();
            return Err(Error::distributed(format!("peer failed: {reason}")));
        }
        Ok(())
    }

    fn all_reduce_mean(&self, grads: &mut HashMap<String, Tensor>) -> Result<()> {
        let world_size = self.shared.world_size;
        if world_size == 1 {
            return Ok(());
        }

        let staged = grads
            .iter()
            .map(|(name, grad)| Ok((name.clone(), grad.to_device(&Device::Cpu)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        self.slots()?[self.rank] = Some(staged);
        self.barrier()?;

        // Sum in rank order so every replica computes identical values
        let reduced = {
            let slots = self.slots()?;
            let mut reduced = HashMap::with_capacity(grads.len());
            for (name, grad) in grads.iter() {
                let mut sum: Option<Tensor> = None;
                for (rank, slot) in slots.iter().enumerate() {
                    let peer = slot
                        .as_ref()
                        .and_then(|g| g.get(name))
                        .ok_or_else(|| Error::distributed(format!("rank {rank} sent no gradient for {name}")))?
                        .to_device(grad.device())?;
                    sum = Some(match sum {
                        Some(acc) => (acc + peer)?,
                        None => peer,
                    });
                }
                if let Some(sum) = sum {
                    reduced.insert(name.clone(), (sum / world_size as f64)?);
                }
            }
            reduced
        };
        self.barrier()?;

        self.slots()?[self.rank] = None;
        *grads = reduced;
        Ok(())
    }

    fn broadcast_parameters(&self, params: &[(String, Var)]) -> Result<()> {
        if self.shared.world_size == 1 {
            return Ok(());
        }

        if self.rank == 0 {
            let staged = params
                .iter()
                .map(|(name, var)| Ok((name.clone(), var.as_tensor().to_device(&Device::Cpu)?)))
                .collect::<Result<HashMap<_, _>>>()?;
            self.slots()?[0] = Some(staged);
        }
        self.barrier()?;

        if self.rank != 0 {
            let slots = self.slots()?;
            let source = slots[0]
                .as_ref()
                .ok_or_else(|| Error::distributed("rank 0 sent no parameters"))?;
            for (name, var) in params {
                let value = source
                    .get(name)
                    .ok_or_else(|| Error::distributed(format!("rank 0 has no parameter {name}")))?;
                var.set(&value.to_device(var.device())?.to_dtype(var.dtype())?)?;
            }
        }
        self.barrier()?;

        if self.rank == 0 {
            self.slots()?[0] = None;
        }
        Ok(())
    }

    fn abort(&self, reason: &str) {
        if let Ok(mut state) = self.shared.state.lock() {
            if state.poisoned.is_none() {
                state.poisoned = Some(format!("rank {}: {reason}", self.rank));
            }
        }
        self.shared.cvar.notify_all();
    }
}

/// Parse a device spec: `auto`, `cpu`, `cuda:N` or `metal:N`.
pub fn parse_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_ascii_lowercase();
    let ordinal = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| Error::configuration(format!("invalid device ordinal in '{spec}'")))
    };
    let device = match spec.as_str() {
        "auto" => Device::cuda_if_available(0)?,
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(0)?,
        "metal" => Device::new_metal(0)?,
        other => {
            if let Some(n) = other.strip_prefix("cuda:") {
                Device::new_cuda(ordinal(n)?)?
            } else if let Some(n) = other.strip_prefix("metal:") {
                Device::new_metal(ordinal(n)?)?
            } else {
                return Err(Error::configuration(format!("unknown device '{spec}'")));
            }
        }
    };
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn local_group_averages_gradients() {
        let groups = LocalGroup::create(3);
        let results: Vec<Vec<f32>> = thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|group| {
                    s.spawn(move || {
                        let value = group.rank() as f32 * 3.0;
                        let mut grads =
                            HashMap::from([("w".to_string(), Tensor::new(&[value, 1.0], &Device::Cpu).unwrap())]);
                        group.all_reduce_mean(&mut grads).unwrap();
                        // A second round must not see stale slots
                        group.all_reduce_mean(&mut grads).unwrap();
                        grads["w"].to_vec1::<f32>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in results {
            assert_eq!(r, vec![3.0, 1.0]);
        }
    }

    #[test]
    fn broadcast_copies_the_coordinator_parameters() {
        let groups = LocalGroup::create(3);
        let results: Vec<Vec<f32>> = thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|group| {
                    s.spawn(move || {
                        let value = group.rank() as f32 + 1.0;
                        let var = Var::from_tensor(&Tensor::new(&[value, -value], &Device::Cpu).unwrap()).unwrap();
                        let params = vec![("w".to_string(), var)];
                        group.broadcast_parameters(&params).unwrap();
                        // Gradients still reduce normally afterwards
                        let mut grads = HashMap::from([("w".to_string(), Tensor::new(&[0f32, 0.], &Device::Cpu).unwrap())]);
                        group.all_reduce_mean(&mut grads).unwrap();
                        params[0].1.as_tensor().to_vec1::<f32>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in results {
            assert_eq!(r, vec![1.0, -1.0]);
        }
    }

    #[test]
    fn abort_wakes_waiting_peers() {
        let groups = LocalGroup::create(2);
        thread::scope(|s| {
            let waiter = s.spawn(|| groups[0].barrier());
            groups[1].abort("out of memory");
            let err = waiter.join().unwrap().unwrap_err();
            assert!(matches!(err, Error::Distributed(_)));
            assert!(err.to_string().contains("out of memory"));
        });
        assert!(groups[1].barrier().is_err());
    }

    #[test]
    fn single_process_is_coordinator() {
        let group = SingleProcess;
        assert!(group.is_coordinator());
        assert_eq!(group.world_size(), 1);
        assert!(group.barrier().is_ok());
    }

    #[test]
    fn device_specs() {
        assert!(matches!(parse_device("cpu"), Ok(Device::Cpu)));
        assert!(parse_device("tpu:0").is_err());
        assert!(parse_device("cuda:x").is_err());
    }
}
