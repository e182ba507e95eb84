//! Step and evaluation bookkeeping for a run

use crate::error::{Error, Result};

/// Per-process numbers derived once from the dataset and run configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingSetup {
    pub dataset_len: usize,
    pub batch_size: usize,
    pub world_size: usize,
    pub gradient_accumulation_steps: usize,
    /// Micro-batches each process sees per epoch
    pub batches_per_epoch: usize,
    pub num_update_steps_per_epoch: usize,
    pub tot_nb_eval_batches: usize,
    /// Images this process generates at every evaluation
    pub nb_eval_images: usize,
    /// Global index of this process's first evaluation image
    pub eval_image_offset: usize,
    pub eval_batch_sizes: Vec<usize>,
}

impl TrainingSetup {
    pub fn compute(
        dataset_len: usize,
        batch_size: usize,
        world_size: usize,
        gradient_accumulation_steps: usize,
        nb_generated_images: usize,
        eval_batch_size: usize,
        rank: usize,
    ) -> Result<Self> {
        if batch_size == 0 || world_size == 0 || gradient_accumulation_steps == 0 {
            return Err(Error::configuration(
                "batch size, world size and gradient accumulation steps must be non-zero",
            ));
        }
        if eval_batch_size == 0 || nb_generated_images == 0 {
            return Err(Error::configuration(
                "eval batch size and number of generated images must be non-zero",
            ));
        }
        if rank >= world_size {
            return Err(Error::configuration(format!(
                "rank {rank} is outside a group of {world_size} processes"
            )));
        }

        let global_batch = batch_size * world_size;
        if dataset_len < global_batch {
            return Err(Error::configuration(format!(
                "dataset has {dataset_len} samples, fewer than one global batch of {global_batch} ({batch_size} x {world_size} processes)"
            )));
        }

        let batches_per_epoch = dataset_len.div_ceil(global_batch);
        let num_update_steps_per_epoch = batches_per_epoch.div_ceil(gradient_accumulation_steps);

        // The last process absorbs the remainder
        let base = nb_generated_images / world_size;
        let remainder = nb_generated_images % world_size;
        let nb_eval_images = if rank == world_size - 1 { base + remainder } else { base };
        let eval_image_offset = rank * base;

        let mut eval_batch_sizes = vec![eval_batch_size; nb_eval_images / eval_batch_size];
        if nb_eval_images % eval_batch_size != 0 {
            eval_batch_sizes.push(nb_eval_images % eval_batch_size);
        }

        Ok(Self {
            dataset_len,
            batch_size,
            world_size,
            gradient_accumulation_steps,
            batches_per_epoch,
            num_update_steps_per_epoch,
            tot_nb_eval_batches: nb_generated_images.div_ceil(eval_batch_size),
            nb_eval_images,
            eval_image_offset,
            eval_batch_sizes,
        })
    }

    /// Optimizer updates over the whole run.
    pub fn max_train_steps(&self, num_epochs: usize) -> usize {
        self.num_update_steps_per_epoch * num_epochs
    }

    /// Whether micro-batch `batch_index` closes an accumulation window.
    pub fn is_update_boundary(&self, batch_index: usize) -> bool {
        (batch_index + 1) % self.gradient_accumulation_steps == 0
            || batch_index + 1 == self.batches_per_epoch
    }
}
