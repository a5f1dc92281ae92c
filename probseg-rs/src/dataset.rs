//! Segmentation datasets and batching.
//!
//! A dataset is a pair of tensors: images `[N, C, H, W]` (f32) and integer
//! labels (u32), either `[N, H, W]` or `[N, R, H, W]` with one map per rater.
//! On disk both live in one safetensors file under the keys `images` and
//! `labels`.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::{DatasetConfig, SyntheticConfig};
use crate::error::{ProbSegError, Result};

/// Safetensors key holding the images.
pub const IMAGES_KEY: &str = "images";
/// Safetensors key holding the labels.
pub const LABELS_KEY: &str = "labels";

/// In-memory segmentation dataset.
///
/// # Example
///
/// ```rust
/// use probseg_rs::config::SyntheticConfig;
/// use probseg_rs::dataset::SegmentationDataset;
/// use rand::SeedableRng;
///
/// # fn main() -> probseg_rs::Result<()> {
/// let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
/// let synthetic = SyntheticConfig { num_samples: 4, num_valid: 0, height: 8, width: 8, num_raters: 1 };
/// let dataset = SegmentationDataset::synthetic(&synthetic, 1, 3, 4, &candle_core::Device::Cpu, &mut rng)?;
/// assert_eq!(dataset.len(), 4);
/// assert_eq!(dataset.labels().dims(), &[4, 8, 8]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SegmentationDataset {
    images: Tensor,
    labels: Tensor,
}

impl SegmentationDataset {
    /// Wrap existing tensors.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the images are not rank 4 or the labels are
    /// neither `[N, H, W]` nor `[N, R, H, W]` (`R > 0`) for the images' `N`,
    /// `H` and `W`.
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let (n, _, h, w) = images.dims4().map_err(|_| {
            ProbSegError::shape_mismatch("images [N, C, H, W]", format!("{:?}", images.dims()))
        })?;
        let valid = match labels.dims() {
            [ln, lh, lw] => (*ln, *lh, *lw) == (n, h, w),
            [ln, r, lh, lw] => *r > 0 && (*ln, *lh, *lw) == (n, h, w),
            _ => false,
        };
        if !valid {
            return Err(ProbSegError::shape_mismatch(
                format!("labels [{n}, {h}, {w}] or [{n}, R, {h}, {w}]"),
                format!("{:?}", labels.dims()),
            ));
        }
        Ok(Self {
            images: images.to_dtype(DType::F32)?,
            labels: labels.to_dtype(DType::U32)?,
        })
    }

    /// Load `images` and `labels` from a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns `Dataset` if the file is missing or lacks a key.
    pub fn from_safetensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ProbSegError::Dataset(format!(
                "Dataset not found: {}",
                path.display()
            )));
        }
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let mut take = |key: &str| {
            tensors.remove(key).ok_or_else(|| {
                ProbSegError::Dataset(format!("{} has no '{key}' tensor", path.display()))
            })
        };
        let images = take(IMAGES_KEY)?;
        let labels = take(LABELS_KEY)?;
        Self::new(images, labels)
    }

    /// Write the dataset in the format read by [`from_safetensors`](Self::from_safetensors).
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let tensors = HashMap::from([
            (IMAGES_KEY.to_string(), self.images.clone()),
            (LABELS_KEY.to_string(), self.labels.clone()),
        ]);
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Random disks on a noisy background.
    ///
    /// Every example gets one disk per foreground class with a random centre
    /// and radius (later classes paint over earlier ones). Each image channel
    /// holds the label value scaled to `[0, 1]` plus Gaussian noise. With
    /// `num_raters > 1` every rater scales each radius by a factor in
    /// `[0.8, 1.2]` and the labels are `[N, R, H, W]`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for empty sizes or fewer than one class.
    pub fn synthetic<R: Rng + ?Sized>(
        config: &SyntheticConfig,
        num_channels: usize,
        num_classes: usize,
        num_samples: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self> {
        let (h, w) = (config.height, config.width);
        let raters = config.num_raters;
        if h == 0 || w == 0 || num_samples == 0 || num_classes == 0 || num_channels == 0 {
            return Err(ProbSegError::Config(
                "synthetic data needs positive sizes and at least one class".into(),
            ));
        }
        if raters == 0 {
            return Err(ProbSegError::Config("synthetic data needs at least one rater".into()));
        }

        let px = h * w;
        let mut labels = vec![0u32; num_samples * raters * px];
        let mut images = Vec::with_capacity(num_samples * num_channels * px);
        let max_radius = (h.min(w) as f32 / 3.0).max(1.0);
        let scale = (num_classes.max(2) - 1) as f32;

        for i in 0..num_samples {
            let disks: Vec<(f32, f32, f32)> = (1..num_classes)
                .map(|_| {
                    let cy = rng.gen_range(0.0..h as f32);
                    let cx = rng.gen_range(0.0..w as f32);
                    (cy, cx, rng.gen_range(1.0..=max_radius))
                })
                .collect();

            let mut consensus = vec![0u32; px];
            paint_disks(&mut consensus, (h, w), &disks, 1.0);
            for r in 0..raters {
                let start = (i * raters + r) * px;
                let map = &mut labels[start..start + px];
                if raters == 1 {
                    map.copy_from_slice(&consensus);
                } else {
                    paint_disks(map, (h, w), &disks, rng.gen_range(0.8..=1.2));
                }
            }

            for _ in 0..num_channels {
                for &l in &consensus {
                    let noise: f32 = rng.sample(StandardNormal);
                    images.push(l as f32 / scale + 0.1 * noise);
                }
            }
        }

        let images = Tensor::from_vec(images, (num_samples, num_channels, h, w), device)?;
        let labels = if raters == 1 {
            Tensor::from_vec(labels, (num_samples, h, w), device)?
        } else {
            Tensor::from_vec(labels, (num_samples, raters, h, w), device)?
        };
        Self::new(images, labels)
    }

    /// Load the configured training and validation sets.
    ///
    /// Without a `train_path` both sets are synthetic. Without a
    /// `valid_path` the validation set is synthetic when the training set is,
    /// and absent otherwise.
    ///
    /// # Errors
    ///
    /// Propagates loading errors.
    pub fn load_splits<R: Rng + ?Sized>(
        config: &DatasetConfig,
        num_channels: usize,
        num_classes: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<(Self, Option<Self>)> {
        match &config.train_path {
            Some(train_path) => {
                let train = Self::from_safetensors(train_path, device)?;
                let valid = config
                    .valid_path
                    .as_ref()
                    .map(|p| Self::from_safetensors(p, device))
                    .transpose()?;
                Ok((train, valid))
            }
            None => {
                let s = &config.synthetic;
                let train =
                    Self::synthetic(s, num_channels, num_classes, s.num_samples, device, rng)?;
                let valid = match &config.valid_path {
                    Some(p) => Some(Self::from_safetensors(p, device)?),
                    None if s.num_valid > 0 => Some(Self::synthetic(
                        s,
                        num_channels,
                        num_classes,
                        s.num_valid,
                        device,
                        rng,
                    )?),
                    None => None,
                };
                Ok((train, valid))
            }
        }
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    /// Whether the dataset has no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Images `[N, C, H, W]`.
    pub fn images(&self) -> &Tensor {
        &self.images
    }

    /// Labels `[N, H, W]`, or `[N, R, H, W]` with several raters.
    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Annotations per example (1 for `[N, H, W]` labels).
    #[must_use]
    pub fn num_raters(&self) -> usize {
        raters_of(&self.labels)
    }

    /// Image channel count.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.images.dims()[1]
    }

    /// Gather the examples at `indices` into a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if an index is out of range.
    pub fn batch(&self, indices: &[usize]) -> Result<Batch> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(ProbSegError::Dataset(format!(
                "index {bad} out of range for {} examples",
                self.len()
            )));
        }
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let ids = Tensor::from_vec(ids, indices.len(), self.images.device())?;
        Ok(Batch {
            images: self.images.index_select(&ids, 0)?,
            labels: self.labels.index_select(&ids, 0)?,
            indices: indices.to_vec(),
        })
    }

    /// Batches over the dataset, optionally in a shuffled order.
    pub fn batches<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        shuffle: bool,
        rng: &mut R,
    ) -> BatchLoader<'_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if shuffle {
            order.shuffle(rng);
        }
        BatchLoader {
            dataset: self,
            order,
            batch_size: batch_size.max(1),
            position: 0,
        }
    }
}

fn raters_of(labels: &Tensor) -> usize {
    match labels.dims() {
        [_, r, _, _] => *r,
        _ => 1,
    }
}

/// Paint one disk per `(cy, cx, radius)`, for classes `1..`, with every radius
/// scaled by `factor`.
fn paint_disks(map: &mut [u32], (h, w): (usize, usize), disks: &[(f32, f32, f32)], factor: f32) {
    for (k, &(cy, cx, radius)) in disks.iter().enumerate() {
        let r = radius * factor;
        for y in 0..h {
            for x in 0..w {
                let (dy, dx) = (y as f32 + 0.5 - cy, x as f32 + 0.5 - cx);
                if dy * dy + dx * dx <= r * r {
                    map[y * w + x] = (k + 1) as u32;
                }
            }
        }
    }
}

/// A batch of images, labels and their dataset positions.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Images `[B, C, H, W]`.
    pub images: Tensor,
    /// Labels `[B, H, W]` or `[B, R, H, W]`.
    pub labels: Tensor,
    /// Dataset index of each example.
    pub indices: Vec<usize>,
}

impl Batch {
    /// Number of examples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Annotations per example.
    #[must_use]
    pub fn num_raters(&self) -> usize {
        raters_of(&self.labels)
    }

    /// Label maps `[B, H, W]` of rater `rater`.
    ///
    /// # Errors
    ///
    /// Returns `Dataset` if `rater` is out of range.
    pub fn rater(&self, rater: usize) -> Result<Tensor> {
        let raters = self.num_raters();
        if rater >= raters {
            return Err(ProbSegError::Dataset(format!(
                "rater {rater} out of range for {raters} annotations"
            )));
        }
        if self.labels.rank() == 4 {
            Ok(self.labels.narrow(1, rater, 1)?.squeeze(1)?.contiguous()?)
        } else {
            Ok(self.labels.clone())
        }
    }

    /// Label maps of a uniformly drawn rater. Single-rater batches do not
    /// consume randomness.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn random_rater<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Tensor> {
        let raters = self.num_raters();
        let rater = if raters > 1 { rng.gen_range(0..raters) } else { 0 };
        self.rater(rater)
    }

    /// Every annotation as `[B, R, H, W]`.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn annotations(&self) -> Result<Tensor> {
        if self.labels.rank() == 4 {
            Ok(self.labels.clone())
        } else {
            Ok(self.labels.unsqueeze(1)?)
        }
    }
}

/// Iterator over the batches of one pass; the last batch may be short.
pub struct BatchLoader<'a> {
    dataset: &'a SegmentationDataset,
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl BatchLoader<'_> {
    /// Number of batches in a full pass.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

impl Iterator for BatchLoader<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let batch = self.dataset.batch(&self.order[self.position..end]);
        self.position = end;
        Some(batch)
    }
}
