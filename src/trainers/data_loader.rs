//! Dataset access, epoch ordering and batch assembly
//!
//! Every replica derives the same permutation from `(seed, epoch)`, then takes
//! its own slice of each global batch. Because the order is a pure function of
//! the epoch, a resumed run can skip exactly the batches it already consumed.

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

use super::DatasetConfig;
use crate::error::{Error, Result};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];

/// One training example: pixels are CHW f32 in [-1, 1] on the CPU.
#[derive(Debug, Clone)]
pub struct Sample {
    pub pixels: Tensor,
    pub caption: String,
    pub class_index: usize,
}

/// Source of labelled training images
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn class_names(&self) -> &[String];

    fn num_classes(&self) -> usize {
        self.class_names().len()
    }

    /// Square side length of every sample.
    fn resolution(&self) -> usize;

    /// Prompt used to condition on a class, both for training and sampling.
    fn caption_for_class(&self, class_index: usize) -> String;

    fn get(&self, index: usize) -> Result<Sample>;
}

/// `root/<class>/<image>` layout, classes in name order.
pub struct ImageFolderDataset {
    root: PathBuf,
    resolution: usize,
    caption_template: String,
    class_names: Vec<String>,
    items: Vec<(PathBuf, usize)>,
}

impl ImageFolderDataset {
    pub fn open(config: &DatasetConfig) -> Result<Self> {
        let root = config.root.clone();
        let what = || format!("dataset {}", root.display());

        let mut class_dirs: Vec<PathBuf> = fs::read_dir(&root)
            .map_err(|e| Error::resource(what(), e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        class_dirs.sort();

        let mut class_names = Vec::new();
        let mut items = Vec::new();
        for dir in class_dirs {
            let mut images: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| is_image(path))
                .collect();
            if images.is_empty() {
                continue;
            }
            images.sort();
            let class_index = class_names.len();
            class_names.push(dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
            items.extend(images.into_iter().map(|path| (path, class_index)));
        }

        if items.is_empty() {
            return Err(Error::resource(what(), "no images found in class subdirectories"));
        }

        log::info!(
            "Loaded dataset {} with {} images in {} classes",
            root.display(),
            items.len(),
            class_names.len()
        );

        Ok(Self {
            root,
            resolution: config.resolution,
            caption_template: config.caption_template.clone(),
            class_names,
            items,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Dataset for ImageFolderDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn resolution(&self) -> usize {
        self.resolution
    }

    fn caption_for_class(&self, class_index: usize) -> String {
        let name = self.class_names.get(class_index).map(String::as_str).unwrap_or("");
        self.caption_template.replace("{class}", name)
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let (path, class_index) = self
            .items
            .get(index)
            .ok_or_else(|| Error::resource("dataset sample", format!("index {index} out of range")))?;
        let pixels = load_image(path, self.resolution)?;
        Ok(Sample {
            pixels,
            caption: self.caption_for_class(*class_index),
            class_index: *class_index,
        })
    }
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

/// Decode, resize to fill, center crop and normalize to [-1, 1].
pub fn load_image(path: &Path, resolution: usize) -> Result<Tensor> {
    let img = image::open(path)
        .map_err(|e| Error::resource(format!("image {}", path.display()), e))?
        .resize_to_fill(resolution as u32, resolution as u32, FilterType::Triangle)
        .to_rgb8();
    let (w, h) = img.dimensions();
    let tensor = Tensor::from_vec(img.into_raw(), (h as usize, w as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?;
    Ok(tensor)
}

/// Deterministic per-epoch order, sharded by rank.
#[derive(Debug, Clone)]
pub struct EpochSampler {
    dataset_len: usize,
    batch_size: usize,
    world_size: usize,
    rank: usize,
    seed: u64,
    shuffle: bool,
}

impl EpochSampler {
    pub fn new(dataset_len: usize, batch_size: usize, world_size: usize, rank: usize, seed: u64, shuffle: bool) -> Self {
        Self {
            dataset_len,
            batch_size,
            world_size,
            rank,
            seed,
            shuffle,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset_len.div_ceil(self.batch_size * self.world_size)
    }

    /// Same on every rank for a given epoch.
    pub fn permutation(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Dataset indices of this rank's micro-batches for `epoch`.
    pub fn batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let order = self.permutation(epoch);
        let global_batch = self.batch_size * self.world_size;

        (0..self.num_batches())
            .map(|k| {
                let start = k * global_batch + self.rank * self.batch_size;
                let positions = start..start + self.batch_size;
                if self.world_size == 1 {
                    positions.filter(|&p| p < order.len()).map(|p| order[p]).collect()
                } else {
                    // Lockstep replicas need equal batches, so wrap around
                    positions.map(|p| order[p % order.len()]).collect()
                }
            })
            .collect()
    }
}

/// A decoded micro-batch
pub struct Batch {
    pub pixels: Tensor,
    pub captions: Vec<String>,
    pub class_indices: Vec<usize>,
}

/// Decodes batches on a dedicated rayon pool.
pub struct DataLoader<'a> {
    dataset: &'a dyn Dataset,
    sampler: EpochSampler,
    pool: rayon::ThreadPool,
    caption_dropout_rate: f32,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a dyn Dataset, sampler: EpochSampler, config: &DatasetConfig) -> Result<Self> {
        let num_workers = config.num_workers.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .build()
            .map_err(|e| Error::resource("data loader thread pool", e))?;
        Ok(Self {
            dataset,
            sampler,
            pool,
            caption_dropout_rate: config.caption_dropout_rate,
        })
    }

    pub fn dataset(&self) -> &dyn Dataset {
        self.dataset
    }

    pub fn sampler(&self) -> &EpochSampler {
        &self.sampler
    }

    pub fn batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        self.sampler.batches(epoch)
    }

    /// Decode `indices` in parallel and stack them into `[B, C, H, W]`.
    pub fn load<R: Rng>(&self, indices: &[usize], rng: &mut R) -> Result<Batch> {
        let samples = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&i| self.dataset.get(i))
                .collect::<Result<Vec<_>>>()
        })?;

        let pixels = Tensor::stack(&samples.iter().map(|s| &s.pixels).collect::<Vec<_>>(), 0)?;
        let mut captions: Vec<String> = samples.iter().map(|s| s.caption.clone()).collect();
        apply_caption_dropout(&mut captions, self.caption_dropout_rate, rng);

        Ok(Batch {
            pixels,
            captions,
            class_indices: samples.iter().map(|s| s.class_index).collect(),
        })
    }
}

/// Replace captions with the empty prompt with probability `rate`.
pub fn apply_caption_dropout<R: Rng>(captions: &mut [String], rate: f32, rng: &mut R) {
    if rate <= 0.0 {
        return;
    }
    for caption in captions.iter_mut() {
        if rng.gen::<f32>() < rate {
            caption.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn single_rank_covers_dataset_once() {
        let sampler = EpochSampler::new(10, 4, 1, 0, 42, true);
        let batches = sampler.batches(0);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);
        let seen: HashSet<_> = batches.iter().flatten().copied().collect();
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn ranks_are_disjoint_within_a_full_epoch() {
        let shards: Vec<_> = (0..2).map(|r| EpochSampler::new(8, 2, 2, r, 7, true).batches(3)).collect();
        let a: HashSet<_> = shards[0].iter().flatten().copied().collect();
        let b: HashSet<_> = shards[1].iter().flatten().copied().collect();
        assert!(a.is_disjoint(&b));
        assert_eq!(a.len() + b.len(), 8);
    }

    #[test]
    fn short_batches_are_padded_for_lockstep() {
        let shards: Vec<_> = (0..2).map(|r| EpochSampler::new(9, 2, 2, r, 1, false).batches(0)).collect();
        for shard in &shards {
            assert_eq!(shard.len(), 3);
            assert!(shard.iter().all(|b| b.len() == 2));
        }
        assert_eq!(shards[0][2], vec![8, 0]);
        assert_eq!(shards[1][2], vec![1, 2]);
    }

    #[test]
    fn order_depends_only_on_seed_and_epoch() {
        let s = EpochSampler::new(50, 5, 1, 0, 3, true);
        assert_eq!(s.permutation(2), s.permutation(2));
        assert_ne!(s.permutation(2), s.permutation(3));
        let unshuffled = EpochSampler::new(5, 5, 1, 0, 3, false);
        assert_eq!(unshuffled.permutation(9), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn caption_dropout_rate_is_respected() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut captions = vec!["a photo of a rose".to_string(); 1000];
        apply_caption_dropout(&mut captions, 0.5, &mut rng);
        let dropped = captions.iter().filter(|c| c.is_empty()).count();
        assert!((dropped as f32 / 1000.0 - 0.5).abs() < 0.05);

        let mut kept = vec!["tulip".to_string(); 10];
        apply_caption_dropout(&mut kept, 0.0, &mut rng);
        assert!(kept.iter().all(|c| c == "tulip"));
    }

    #[test]
    fn image_folder_reads_classes_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for (class, color) in [("tulip", [200u8, 0, 0]), ("rose", [0u8, 0, 200])] {
            let class_dir = dir.path().join(class);
            fs::create_dir_all(&class_dir)?;
            for i in 0..2 {
                let img = image::RgbImage::from_pixel(12, 10, image::Rgb(color));
                img.save(class_dir.join(format!("{i}.png")))?;
            }
        }
        fs::write(dir.path().join("rose").join("notes.txt"), "ignored")?;

        let config = DatasetConfig {
            root: dir.path().to_path_buf(),
            resolution: 8,
            caption_template: "a photo of a {class}".to_string(),
            caption_dropout_rate: 0.0,
            shuffle: true,
            num_workers: Some(2),
        };
        let dataset = ImageFolderDataset::open(&config)?;
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.class_names(), &["rose".to_string(), "tulip".to_string()]);

        let sample = dataset.get(0)?;
        assert_eq!(sample.caption, "a photo of a rose");
        assert_eq!(sample.pixels.dims(), &[3, 8, 8]);

        let loader = DataLoader::new(&dataset, EpochSampler::new(4, 2, 1, 0, 0, false), &config)?;
        let batch = loader.load(&[1, 3], &mut StdRng::seed_from_u64(0))?;
        assert_eq!(batch.pixels.dims(), &[2, 3, 8, 8]);
        assert_eq!(batch.class_indices, vec![0, 1]);
        let max = batch.pixels.max_all()?.to_scalar::<f32>()?;
        assert!(max <= 1.0);
        Ok(())
    }

    #[test]
    fn missing_root_is_a_resource_error() {
        let config = DatasetConfig {
            root: PathBuf::from("/nonexistent/dataset"),
            resolution: 8,
            caption_template: "{class}".to_string(),
            caption_dropout_rate: 0.0,
            shuffle: false,
            num_workers: None,
        };
        assert!(matches!(ImageFolderDataset::open(&config), Err(Error::ResourceLoad { .. })));
    }
}
