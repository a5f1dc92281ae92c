//! Sampling trainer: single-sample training steps and ensemble validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::{Objective, ProbSegConfig};
use crate::dataset::{Batch, SegmentationDataset};
use crate::error::{ProbSegError, Result};
use crate::loss::{elbo_loss, Criterion};
use crate::metrics::{Metric, MetricTracker};
use crate::model::{ForwardMode, KlEstimate, PosteriorDraw, ProbabilisticSegmenter, SampleMode};
use crate::optimizer::{AdamWOptimizer, OptimizerConfig};
use crate::scheduler::{LRScheduler, SchedulerType};
use crate::visualization::{GridRenderer, ValidationView, Visualizer};

/// File name of the best model under the output directory.
pub const BEST_MODEL_FILE: &str = "model_best.safetensors";

/// Periodic checkpoint path for `epoch`.
#[must_use]
pub fn checkpoint_path(output_dir: &Path, epoch: usize) -> PathBuf {
    output_dir.join(format!("checkpoint-epoch{epoch}.safetensors"))
}

/// Trainer state file belonging to the checkpoint at `checkpoint`.
///
/// `checkpoint-epoch3.safetensors` pairs with `checkpoint-epoch3.state.json`.
#[must_use]
pub fn state_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("state.json")
}

/// `N` stochastic predictions for the same batch.
#[derive(Debug, Clone)]
pub struct SampleEnsemble {
    samples: Tensor,
}

impl SampleEnsemble {
    /// Stacked logits `[B, N, C, H, W]`.
    pub fn samples(&self) -> &Tensor {
        &self.samples
    }

    /// Number of samples `N`.
    #[must_use]
    pub fn num_samples(&self) -> usize {
        self.samples.dims()[1]
    }

    /// Point estimate: elementwise mean over the sample axis, `[B, C, H, W]`.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn mean(&self) -> Result<Tensor> {
        Ok(self.samples.mean(1)?)
    }

    /// Arg-max labels of each sample, `[B, N, H, W]`.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn labels(&self) -> Result<Tensor> {
        Ok(self.samples.argmax(2)?)
    }
}

/// Run `num_samples` independent inference forwards with fresh prior draws.
///
/// # Errors
///
/// Returns `Precondition` for `num_samples == 0`; otherwise propagates model
/// errors.
pub fn sample_ensemble<R: Rng + ?Sized>(
    model: &ProbabilisticSegmenter,
    images: &Tensor,
    num_samples: usize,
    rng: &mut R,
) -> Result<SampleEnsemble> {
    if num_samples == 0 {
        return Err(ProbSegError::precondition("a sample ensemble needs at least one sample"));
    }
    let mut draws = Vec::with_capacity(num_samples);
    for _ in 0..num_samples {
        let ctx = model.forward(images, None, ForwardMode::Inference)?;
        draws.push(model.sample(&ctx, SampleMode::Test, rng)?.detach());
    }
    Ok(SampleEnsemble {
        samples: Tensor::stack(&draws, 1)?,
    })
}

/// Averaged metrics of one epoch. Validation keys carry a `val_` prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochLog {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Metric name to value.
    pub metrics: BTreeMap<String, f64>,
}

impl EpochLog {
    /// Value of `key`, if logged.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }
}

/// One validated example, kept until the epoch's results are reordered.
#[derive(Debug, Clone)]
pub struct ValidationRecord {
    /// Dataset index.
    pub index: usize,
    /// Image `[C, H, W]`.
    pub input: Tensor,
    /// Sample labels `[N, H, W]`.
    pub samples: Tensor,
    /// Target labels `[H, W]`.
    pub target: Tensor,
    /// Point-estimate scores `[C, H, W]`.
    pub output: Tensor,
}

/// Stable-sort `records` by dataset index and stack them into a view.
///
/// # Errors
///
/// Returns `Training` for an empty record list.
pub fn collate_validation(mut records: Vec<ValidationRecord>) -> Result<ValidationView> {
    if records.is_empty() {
        return Err(ProbSegError::Training("no validation records to collate".into()));
    }
    records.sort_by_key(|r| r.index);

    let n = records.len();
    let (mut inputs, mut samples, mut targets, mut outputs) =
        (Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n));
    for record in records {
        inputs.push(record.input);
        samples.push(record.samples);
        targets.push(record.target);
        outputs.push(record.output);
    }
    Ok(ValidationView {
        inputs: Tensor::stack(&inputs, 0)?,
        samples: Tensor::stack(&samples, 0)?,
        targets: Tensor::stack(&targets, 0)?,
        outputs: Tensor::stack(&outputs, 0)?,
    })
}

/// Best monitored value and the epochs since it last improved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorState {
    /// Best value seen so far.
    pub best: Option<f64>,
    /// Consecutive epochs without improvement.
    pub not_improved: usize,
}

impl MonitorState {
    /// Record `value`; returns whether it is a new best. Ties count as
    /// improvements.
    pub fn observe(&mut self, value: f64, lower_is_better: bool) -> bool {
        let improved = match self.best {
            None => true,
            Some(best) if lower_is_better => value <= best,
            Some(best) => value >= best,
        };
        if improved {
            self.best = Some(value);
            self.not_improved = 0;
        } else {
            self.not_improved += 1;
        }
        improved
    }

    /// Whether more than `patience` epochs passed without improvement.
    #[must_use]
    pub fn should_stop(&self, patience: usize) -> bool {
        self.not_improved > patience
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrainingState {
    epoch: usize,
    learning_rate: f64,
    monitor: MonitorState,
}

/// Batches between debug loss lines.
#[must_use]
pub fn log_step(batch_size: usize) -> usize {
    ((batch_size as f64).sqrt() as usize).max(1)
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use probseg_rs::{ProbSegConfig, SamplingTrainer};
///
/// # fn main() -> probseg_rs::Result<()> {
/// let config = ProbSegConfig::from_preset("tiny")?;
/// let mut trainer = SamplingTrainer::new(config)?;
/// let logs = trainer.train()?;
/// println!("final loss: {:?}", logs.last().and_then(|l| l.get("loss")));
/// # Ok(())
/// # }
/// ```
pub struct SamplingTrainer {
    config: ProbSegConfig,
    device: Device,
    model: ProbabilisticSegmenter,
    optimizer: AdamWOptimizer,
    scheduler: LRScheduler,
    criterion: Criterion,
    train_data: SegmentationDataset,
    valid_data: Option<SegmentationDataset>,
    visualizer: Option<Box<dyn Visualizer>>,
    rng: ChaCha8Rng,
    epoch: usize,
    monitor: MonitorState,
}

impl SamplingTrainer {
    /// Build model, optimizer and datasets from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or data cannot be loaded.
    pub fn new(config: ProbSegConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device.resolve()?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let (train, valid) = SegmentationDataset::load_splits(
            &config.dataset,
            config.model.num_channels,
            config.model.num_classes,
            &device,
            &mut rng,
        )?;
        Self::build(config, device, train, valid, rng)
    }

    /// Build around caller-provided datasets.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_datasets(
        config: ProbSegConfig,
        train: SegmentationDataset,
        valid: Option<SegmentationDataset>,
    ) -> Result<Self> {
        config.validate()?;
        let device = config.device.resolve()?;
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self::build(config, device, train, valid, rng)
    }

    fn build(
        config: ProbSegConfig,
        device: Device,
        train: SegmentationDataset,
        valid: Option<SegmentationDataset>,
        rng: ChaCha8Rng,
    ) -> Result<Self> {
        if train.is_empty() {
            return Err(ProbSegError::Dataset("training set is empty".into()));
        }
        for (name, data) in [("training", Some(&train)), ("validation", valid.as_ref())] {
            if let Some(data) = data {
                if data.num_channels() != config.model.num_channels {
                    return Err(ProbSegError::shape_mismatch(
                        format!("{} image channels in the {name} set", config.model.num_channels),
                        format!("{}", data.num_channels()),
                    ));
                }
            }
        }

        let model = ProbabilisticSegmenter::new(&config.model, &config.backbone, &device)?;
        let optimizer = OptimizerConfig::from(&config.training).build_adamw(model.varmap())?;
        let scheduler = LRScheduler::new(
            SchedulerType::from_config(&config.training.lr_scheduler, config.training.epochs),
            config.training.learning_rate,
        );
        let visualizer: Option<Box<dyn Visualizer>> = if config.visualization.enabled {
            Some(Box::new(GridRenderer::new(
                &config.output_dir,
                config.visualization.cell_size,
            )))
        } else {
            None
        };

        tracing::info!(
            "Initialized AdamW optimizer with lr={}, {} trainable params",
            optimizer.learning_rate(),
            model.num_parameters()?
        );

        Ok(Self {
            criterion: Criterion::new(config.training.criterion),
            config,
            device,
            model,
            optimizer,
            scheduler,
            train_data: train,
            valid_data: valid,
            visualizer,
            rng,
            epoch: 0,
            monitor: MonitorState::default(),
        })
    }

    /// Replace the validation visualizer (`None` disables rendering).
    pub fn set_visualizer(&mut self, visualizer: Option<Box<dyn Visualizer>>) {
        self.visualizer = visualizer;
    }

    /// The model being trained.
    pub fn model(&self) -> &ProbabilisticSegmenter {
        &self.model
    }

    /// Mutable access to the model.
    pub fn model_mut(&mut self) -> &mut ProbabilisticSegmenter {
        &mut self.model
    }

    /// Device of the run.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Last completed epoch (0 before training).
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Best monitored value so far.
    #[must_use]
    pub fn monitor_best(&self) -> Option<f64> {
        self.monitor.best
    }

    fn batches_per_epoch(&self) -> usize {
        self.config.training.len_epoch.unwrap_or_else(|| {
            self.train_data
                .len()
                .div_ceil(self.config.training.batch_size)
        })
    }

    fn single_metric_names(&self) -> Vec<&'static str> {
        self.config
            .training
            .metrics
            .iter()
            .filter(|m| matches!(m, Metric::Single(_)))
            .map(Metric::name)
            .collect()
    }

    /// Run every configured epoch and return the per-epoch logs.
    ///
    /// # Errors
    ///
    /// Propagates model, data and I/O errors.
    pub fn train(&mut self) -> Result<Vec<EpochLog>> {
        let t = &self.config.training;
        tracing::info!("Starting training");
        tracing::info!("  Objective: {:?}, criterion: {:?}", t.objective, t.criterion);
        tracing::info!("  Epochs: {}", t.epochs);
        tracing::info!(
            "  Training examples: {}, validation examples: {}",
            self.train_data.len(),
            self.valid_data.as_ref().map_or(0, SegmentationDataset::len)
        );

        std::fs::create_dir_all(&self.config.output_dir)?;
        let output_dir = PathBuf::from(&self.config.output_dir);
        let mut target = self
            .config
            .training
            .monitor
            .target()
            .map(|(k, lower)| (k.to_string(), lower));
        let mut logs = Vec::with_capacity(self.config.training.epochs);

        for epoch in self.epoch + 1..=self.config.training.epochs {
            let log = self.train_epoch(epoch)?;
            for (key, value) in &log.metrics {
                tracing::info!("    {:15}: {}", key, value);
            }
            self.epoch = epoch;

            let mut best = false;
            if let Some((key, lower_is_better)) = target.clone() {
                match log.get(&key) {
                    None => {
                        tracing::warn!(
                            "Metric '{}' is not found. Model performance monitoring is disabled.",
                            key
                        );
                        target = None;
                    }
                    Some(value) => best = self.monitor.observe(value, lower_is_better),
                }
            }

            let period = self.config.training.save_period;
            if period > 0 && epoch % period == 0 {
                self.save_checkpoint(&checkpoint_path(&output_dir, epoch))?;
            }
            if best {
                self.model.save(output_dir.join(BEST_MODEL_FILE))?;
                tracing::info!("Saving current best: {}", BEST_MODEL_FILE);
            }

            logs.push(log);

            if let Some(patience) = self.config.training.early_stop {
                if target.is_some() && self.monitor.should_stop(patience) {
                    tracing::warn!(
                        "Validation performance didn't improve for {} epochs. Training stops.",
                        patience
                    );
                    break;
                }
            }
        }

        self.model.set_training(false);
        Ok(logs)
    }

    /// One training pass followed by validation (when a validation set
    /// exists) and one scheduler step.
    ///
    /// # Errors
    ///
    /// Propagates model and optimizer errors.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<EpochLog> {
        self.model.set_training(true);
        let single = self.single_metric_names();
        let mut tracker = MetricTracker::new(std::iter::once("loss").chain(single.iter().copied()));

        let len_epoch = self.batches_per_epoch();
        let batch_size = self.config.training.batch_size;
        let step = log_step(batch_size);
        let cycling = self.config.training.len_epoch.is_some();

        let pb = ProgressBar::new(len_epoch as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );

        let mut batch_idx = 0;
        'epoch: loop {
            let order: Vec<Batch> = self
                .train_data
                .batches(batch_size, self.config.dataset.shuffle, &mut self.rng)
                .collect::<Result<_>>()?;
            for batch in order {
                if batch_idx == len_epoch {
                    break 'epoch;
                }
                let target = batch.random_rater(&mut self.rng)?;
                let (loss, output) = self.training_step(&batch.images, &target)?;
                tracker.update("loss", loss, 1);
                for metric in &self.config.training.metrics {
                    if let Metric::Single(m) = metric {
                        tracker.update(metric.name(), m.compute(&output, &target)?, 1);
                    }
                }

                if batch_idx % step == 0 {
                    let (current, total) = if cycling {
                        (batch_idx, len_epoch)
                    } else {
                        (batch_idx * batch_size, self.train_data.len())
                    };
                    tracing::debug!(
                        "Train Epoch: {} [{}/{} ({:.0}%)] Loss: {:.6}",
                        epoch,
                        current,
                        total,
                        100.0 * current as f64 / total as f64,
                        loss
                    );
                }
                pb.set_message(format!("{loss:.4}"));
                pb.inc(1);
                batch_idx += 1;
            }
            if !cycling {
                break;
            }
        }
        pb.finish_and_clear();

        let mut metrics = tracker.result();
        if self.valid_data.is_some() {
            let val = self.valid_epoch(epoch)?;
            metrics.extend(val.into_iter().map(|(k, v)| (format!("val_{k}"), v)));
        }
        self.scheduler.step(&mut self.optimizer);
        Ok(EpochLog { epoch, metrics })
    }

    /// One optimizer step against `target` `[B, H, W]`; returns the scalar
    /// loss and the detached logits.
    fn training_step(&mut self, images: &Tensor, target: &Tensor) -> Result<(f64, Tensor)> {
        let (loss, logits) = match self.config.training.objective {
            Objective::Supervised => {
                let ctx = self.model.forward(images, None, ForwardMode::Inference)?;
                let logits = self.model.sample(&ctx, SampleMode::Train, &mut self.rng)?;
                (self.criterion.compute(&logits, target)?, logits)
            }
            Objective::Elbo => {
                let ctx = self.model.forward(images, Some(target), ForwardMode::Training)?;
                let logits = self.model.reconstruct(&ctx, PosteriorDraw::Sample, &mut self.rng)?;
                let kl = self.model.kl_divergence(&ctx, KlEstimate::Analytic, &mut self.rng)?;
                let loss = elbo_loss(
                    &self.criterion,
                    &logits,
                    target,
                    &kl,
                    self.model.config().beta,
                )?;
                (loss, logits)
            }
        };

        let value = f64::from(loss.to_scalar::<f32>()?);
        if !value.is_finite() {
            return Err(ProbSegError::NumericDegeneracy(format!(
                "training loss is {value}"
            )));
        }
        self.optimizer.step(&loss)?;
        Ok((value, logits.detach()))
    }

    /// Ensemble validation; returns un-prefixed averages and renders the grid.
    ///
    /// With several raters the loss, the single metrics and the rendered
    /// target use one randomly drawn rater per batch, while ensemble metrics
    /// see every annotation.
    ///
    /// # Errors
    ///
    /// Returns `Training` if there is no validation set.
    pub fn valid_epoch(&mut self, epoch: usize) -> Result<BTreeMap<String, f64>> {
        let valid = self
            .valid_data
            .as_ref()
            .ok_or_else(|| ProbSegError::Training("no validation set configured".into()))?;
        self.model.set_training(false);

        let names = self.config.training.metrics.iter().map(Metric::name);
        let mut tracker = MetricTracker::new(std::iter::once("loss").chain(names));
        let num_classes = self.model.config().num_classes;
        let n = self.config.training.metrics_sample_count;
        let mut records = Vec::with_capacity(valid.len());

        for batch in valid.batches(self.config.training.batch_size, false, &mut self.rng) {
            let batch = batch?;
            let ensemble = sample_ensemble(&self.model, &batch.images, n, &mut self.rng)?;
            let output = ensemble.mean()?;
            let target = batch.random_rater(&mut self.rng)?;
            let annotations = batch.annotations()?;
            let loss = self.criterion.compute(&output, &target)?;
            tracker.update("loss", f64::from(loss.to_scalar::<f32>()?), 1);

            let samples = ensemble.labels()?;
            for metric in &self.config.training.metrics {
                let value = match metric {
                    Metric::Single(m) => m.compute(&output, &target)?,
                    Metric::Ensemble(m) => m.compute(&samples, &annotations, num_classes)?,
                };
                tracker.update(metric.name(), value, 1);
            }

            for (i, &index) in batch.indices.iter().enumerate() {
                records.push(ValidationRecord {
                    index,
                    input: batch.images.get(i)?,
                    samples: samples.get(i)?,
                    target: target.get(i)?,
                    output: output.get(i)?,
                });
            }
        }

        if let Some(visualizer) = self.visualizer.as_mut() {
            let view = collate_validation(records)?;
            visualizer.visualize(epoch, &view, self.config.visualization.max_examples)?;
        }
        Ok(tracker.result())
    }

    /// Save the model to `path` and the trainer state to [`state_path`].
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        self.model.save(path)?;
        let state = TrainingState {
            epoch: self.epoch,
            learning_rate: self.optimizer.learning_rate(),
            monitor: self.monitor,
        };
        std::fs::write(state_path(path), serde_json::to_string_pretty(&state)?)?;
        tracing::info!("Saved checkpoint to: {}", path.display());
        Ok(())
    }

    /// Restore model parameters and trainer state from a checkpoint written
    /// by [`save_checkpoint`](Self::save_checkpoint).
    ///
    /// # Errors
    ///
    /// Returns `Checkpoint` if the files are missing or inconsistent with the
    /// configured architecture.
    pub fn resume_from(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(ProbSegError::Checkpoint(format!(
                "Checkpoint not found: {}",
                path.display()
            )));
        }
        let state_file = state_path(path);
        if !state_file.exists() {
            return Err(ProbSegError::Checkpoint(format!(
                "Trainer state not found: {}",
                state_file.display()
            )));
        }
        let loaded = ProbabilisticSegmenter::load(path, &self.device)?;
        if loaded.config() != self.model.config() {
            return Err(ProbSegError::Checkpoint(
                "checkpoint architecture differs from the configuration".into(),
            ));
        }
        self.model = loaded;
        self.optimizer = OptimizerConfig::from(&self.config.training).build_adamw(self.model.varmap())?;

        let state_json = std::fs::read_to_string(&state_file)?;
        let state: TrainingState = serde_json::from_str(&state_json)?;
        self.epoch = state.epoch;
        self.monitor = state.monitor;
        self.scheduler = LRScheduler::new(
            SchedulerType::from_config(&self.config.training.lr_scheduler, self.config.training.epochs),
            self.config.training.learning_rate,
        );
        for _ in 0..state.epoch {
            self.scheduler.step(&mut self.optimizer);
        }
        tracing::info!(
            "Loaded checkpoint from: {} (epoch={}, lr={:.2e})",
            path.display(),
            state.epoch,
            self.optimizer.learning_rate()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyntheticConfig;
    use tempfile::TempDir;

    fn tiny_config(output_dir: &Path) -> ProbSegConfig {
        let mut config = ProbSegConfig::tiny_preset();
        config.output_dir = output_dir.to_string_lossy().into();
        config.dataset.synthetic = SyntheticConfig {
            num_samples: 4,
            num_valid: 3,
            height: 8,
            width: 8,
            num_raters: 1,
        };
        config
    }

    #[test]
    fn test_log_step() {
        assert_eq!(log_step(1), 1);
        assert_eq!(log_step(4), 2);
        assert_eq!(log_step(10), 3);
        assert_eq!(log_step(0), 1);
    }

    #[test]
    fn test_monitor_state_min_and_patience() {
        let mut state = MonitorState::default();
        assert!(state.observe(1.0, true));
        assert!(state.observe(1.0, true));
        assert!(!state.observe(1.5, true));
        assert!(!state.should_stop(1));
        assert!(!state.observe(2.0, true));
        assert!(state.should_stop(1));
        assert!(state.observe(0.5, true));
        assert_eq!(state.not_improved, 0);
        assert_eq!(state.best, Some(0.5));
    }

    #[test]
    fn test_monitor_state_max() {
        let mut state = MonitorState::default();
        assert!(state.observe(0.2, false));
        assert!(!state.observe(0.1, false));
        assert!(state.observe(0.3, false));
        assert!(!state.should_stop(0));
    }

    #[test]
    fn test_checkpoint_path() {
        assert_eq!(
            checkpoint_path(Path::new("/tmp/run"), 3),
            PathBuf::from("/tmp/run/checkpoint-epoch3.safetensors")
        );
    }

    #[test]
    fn test_collate_sorts_by_index() {
        let dev = Device::Cpu;
        let record = |index: usize| ValidationRecord {
            index,
            input: Tensor::full(index as f32, (1, 2, 2), &dev).unwrap(),
            samples: Tensor::zeros((2, 2, 2), candle_core::DType::U32, &dev).unwrap(),
            target: Tensor::zeros((2, 2), candle_core::DType::U32, &dev).unwrap(),
            output: Tensor::zeros((3, 2, 2), candle_core::DType::F32, &dev).unwrap(),
        };
        let view = collate_validation(vec![record(2), record(0), record(1)]).unwrap();
        assert_eq!(view.inputs.dims(), &[3, 1, 2, 2]);
        let firsts: Vec<f32> = view
            .inputs
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .chunks(4)
            .map(|c| c[0])
            .collect();
        assert_eq!(firsts, vec![0.0, 1.0, 2.0]);
        assert!(collate_validation(Vec::new()).is_err());
    }

    #[test]
    fn test_trainer_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(dir.path());
        config.training.metrics_sample_count = 0;
        assert!(matches!(SamplingTrainer::new(config), Err(ProbSegError::Config(_))));
    }

    #[test]
    fn test_train_writes_checkpoints_and_grid() {
        let dir = TempDir::new().unwrap();
        let mut trainer = SamplingTrainer::new(tiny_config(dir.path())).unwrap();
        let logs = trainer.train().unwrap();

        assert_eq!(logs.len(), 2);
        assert_eq!(trainer.epoch(), 2);
        let last = &logs[1];
        assert!(last.get("loss").unwrap().is_finite());
        assert!(last.get("val_loss").is_some());
        assert!(last.get("val_ged").is_some());
        assert!(last.get("val_sample_variance").is_some());
        assert!(last.get("ged").is_none());

        assert!(dir.path().join("checkpoint-epoch1.safetensors").exists());
        assert!(dir.path().join("checkpoint-epoch2.safetensors").exists());
        assert!(dir.path().join("checkpoint-epoch1.state.json").exists());
        assert!(dir.path().join("checkpoint-epoch2.state.json").exists());
        assert!(dir.path().join(BEST_MODEL_FILE).exists());
        assert!(dir.path().join("segmentations_epoch2.png").exists());
        assert!(!trainer.model().is_training());
    }

    #[test]
    fn test_len_epoch_cycles_loader() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(dir.path());
        config.training.epochs = 1;
        config.training.len_epoch = Some(5);
        config.dataset.synthetic.num_valid = 0;
        let mut trainer = SamplingTrainer::new(config).unwrap();
        let log = trainer.train_epoch(1).unwrap();
        assert!(log.get("loss").is_some());
        assert!(log.get("val_loss").is_none());
    }

    #[test]
    fn test_lidc_style_raters_train() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(dir.path());
        config.training.epochs = 1;
        config.dataset.synthetic.num_raters = 4;
        let mut trainer = SamplingTrainer::new(config).unwrap();
        assert_eq!(trainer.train_data.num_raters(), 4);
        let logs = trainer.train().unwrap();
        assert!(logs[0].get("loss").unwrap().is_finite());
        assert!(logs[0].get("val_ged").is_some());
    }

    #[test]
    fn test_elbo_objective_trains() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(dir.path());
        config.training.epochs = 1;
        config.training.objective = Objective::Elbo;
        config.visualization.enabled = false;
        let mut trainer = SamplingTrainer::new(config).unwrap();
        let logs = trainer.train().unwrap();
        assert!(logs[0].get("loss").unwrap().is_finite());
        assert!(!dir.path().join("segmentations_epoch1.png").exists());
    }

    #[test]
    fn test_missing_monitor_metric_disables_selection() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(dir.path());
        config.training.epochs = 1;
        config.training.monitor = crate::config::Monitor::Max("val_hausdorff".into());
        let mut trainer = SamplingTrainer::new(config).unwrap();
        trainer.train().unwrap();
        assert!(trainer.monitor_best().is_none());
        assert!(!dir.path().join(BEST_MODEL_FILE).exists());
    }

    #[test]
    fn test_state_path_pairs_with_checkpoint() {
        let dir = Path::new("/tmp/run");
        assert_eq!(
            state_path(&checkpoint_path(dir, 3)),
            dir.join("checkpoint-epoch3.state.json")
        );
    }

    #[test]
    fn test_resume_restores_epoch() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(dir.path());
        config.training.save_period = 1;
        config.training.lr_scheduler = crate::config::LrScheduler::Linear;
        let mut trainer = SamplingTrainer::new(config.clone()).unwrap();
        trainer.train().unwrap();
        assert_eq!(trainer.epoch(), 2);

        // resume from the older of two checkpoints
        let mut resumed = SamplingTrainer::new(config.clone()).unwrap();
        resumed
            .resume_from(&checkpoint_path(dir.path(), 1))
            .unwrap();
        assert_eq!(resumed.epoch(), 1);

        let mut reference = SamplingTrainer::new(config).unwrap();
        reference.train_epoch(1).unwrap();
        assert!((resumed.learning_rate() - reference.learning_rate()).abs() < 1e-12);

        let logs = resumed.train().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].epoch, 2);
    }

    #[test]
    fn test_resume_without_state_file() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(dir.path());
        config.training.epochs = 1;
        let mut trainer = SamplingTrainer::new(config).unwrap();
        trainer.train().unwrap();
        std::fs::remove_file(state_path(&checkpoint_path(dir.path(), 1))).unwrap();
        assert!(matches!(
            trainer.resume_from(&checkpoint_path(dir.path(), 1)),
            Err(ProbSegError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_resume_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut trainer = SamplingTrainer::new(tiny_config(dir.path())).unwrap();
        assert!(matches!(
            trainer.resume_from(&dir.path().join("nope.safetensors")),
            Err(ProbSegError::Checkpoint(_))
        ));
    }
}
