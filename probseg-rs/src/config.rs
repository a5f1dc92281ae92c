//! Configuration parsing and validation.

use std::fmt;
use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{ProbSegError, Result};
use crate::metrics::Metric;

/// Main configuration for a probabilistic segmentation run.
///
/// # Example
///
/// ```rust
/// use probseg_rs::ProbSegConfig;
///
/// # fn main() -> probseg_rs::Result<()> {
/// let config = ProbSegConfig::from_preset("quicknat-28")?;
/// config.validate()?;
///
/// // The first filter count always equals the number of classes.
/// assert_eq!(config.model.effective_filter_counts()[0], 28);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbSegConfig {
    /// Probabilistic head configuration.
    #[serde(default)]
    pub model: ModelConfig,

    /// Segmentation backbone configuration.
    #[serde(default)]
    pub backbone: BackboneConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Dataset configuration.
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Validation grid rendering.
    #[serde(default)]
    pub visualization: VisualizationConfig,

    /// Output directory for checkpoints and grids.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Seed for latent sampling, shuffling and synthetic data.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Compute device for every tensor of a model instance.
    #[serde(default)]
    pub device: DeviceSpec,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

impl Default for ProbSegConfig {
    fn default() -> Self {
        Self::quicknat_28_preset()
    }
}

/// Weight initialization policy for convolution weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightInit {
    /// He-normal, fan-in mode, ReLU gain.
    #[default]
    #[serde(alias = "he_normal", alias = "kaiming")]
    Default,
    /// Orthogonal rows/columns of the flattened kernel.
    Orthogonal,
}

/// Configuration of the latent-variable part of the model.
///
/// # Example
///
/// ```rust
/// use probseg_rs::config::ModelConfig;
///
/// let model = ModelConfig {
///     num_classes: 2,
///     filter_counts: vec![32, 64, 128],
///     ..Default::default()
/// };
/// assert_eq!(model.effective_filter_counts(), vec![2, 64, 128]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Input image channels.
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,

    /// Number of segmentation classes.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    /// Dimensionality of the latent space.
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,

    /// Per-stage filter counts of the prior/posterior encoders.
    /// The first entry is replaced by `num_classes`.
    #[serde(default = "default_filter_counts")]
    pub filter_counts: Vec<usize>,

    /// Convolutions per encoder stage.
    #[serde(default = "default_convs_per_block")]
    pub convs_per_block: usize,

    /// 1x1 convolutions in the feature combiner (including the output layer).
    #[serde(default = "default_convs_per_fcomb_block")]
    pub convs_per_fcomb_block: usize,

    /// KL weight; only consumed by the ELBO objective.
    #[serde(default = "default_beta")]
    pub beta: f64,

    /// Same-padding for encoder convolutions.
    #[serde(default = "default_true")]
    pub padding: bool,

    /// Initialization of the prior/posterior encoders.
    #[serde(default)]
    pub weight_init: WeightInit,

    /// Initialization of the feature combiner.
    #[serde(default = "default_fcomb_init")]
    pub fcomb_weight_init: WeightInit,

    /// Seed used for parameter initialization.
    #[serde(default = "default_init_seed")]
    pub init_seed: u64,

    /// Check log-scales for NaN/Inf and analytic KL for negativity.
    #[serde(default = "default_true")]
    pub check_numerics: bool,
}

fn default_num_channels() -> usize {
    1
}
fn default_num_classes() -> usize {
    28
}
fn default_latent_dim() -> usize {
    6
}
fn default_filter_counts() -> Vec<usize> {
    vec![32, 64, 128, 192]
}
fn default_convs_per_block() -> usize {
    3
}
fn default_convs_per_fcomb_block() -> usize {
    4
}
fn default_beta() -> f64 {
    10.0
}
fn default_fcomb_init() -> WeightInit {
    WeightInit::Orthogonal
}
fn default_init_seed() -> u64 {
    1234
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_channels: default_num_channels(),
            num_classes: default_num_classes(),
            latent_dim: default_latent_dim(),
            filter_counts: default_filter_counts(),
            convs_per_block: default_convs_per_block(),
            convs_per_fcomb_block: default_convs_per_fcomb_block(),
            beta: default_beta(),
            padding: true,
            weight_init: WeightInit::Default,
            fcomb_weight_init: default_fcomb_init(),
            init_seed: default_init_seed(),
            check_numerics: true,
        }
    }
}

impl ModelConfig {
    /// Filter counts with the first entry forced to `num_classes`.
    ///
    /// The feature combiner's input width is derived from this first entry,
    /// and the backbone must emit exactly that many channels.
    #[must_use]
    pub fn effective_filter_counts(&self) -> Vec<usize> {
        let mut filters = Vec::with_capacity(self.filter_counts.len().max(1));
        filters.push(self.num_classes);
        filters.extend(self.filter_counts.iter().skip(1).copied());
        filters
    }

    /// Channel count the backbone has to produce.
    #[must_use]
    pub fn feature_channels(&self) -> usize {
        self.num_classes
    }
}

/// SegNet-style backbone configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Widths of the encoder stages (decoder mirrors them).
    #[serde(default = "default_backbone_filters")]
    pub filters: Vec<usize>,

    /// Convolution + batch-norm + ReLU units per stage.
    #[serde(default = "default_convs_per_stage")]
    pub convs_per_stage: usize,
}

fn default_backbone_filters() -> Vec<usize> {
    vec![64, 128, 256]
}
fn default_convs_per_stage() -> usize {
    2
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            filters: default_backbone_filters(),
            convs_per_stage: default_convs_per_stage(),
        }
    }
}

/// What the training step optimizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    /// One prior sample per batch scored against the target.
    #[default]
    Supervised,
    /// Posterior reconstruction loss plus `beta` times the analytic KL.
    Elbo,
}

/// Supervised loss between logits and target labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    /// Pixel-wise cross-entropy.
    #[default]
    CrossEntropy,
    /// Soft multi-class dice loss.
    Dice,
    /// Sum of cross-entropy and dice.
    CrossEntropyDice,
}

/// Learning rate scheduler, stepped once per epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrScheduler {
    /// Constant learning rate.
    #[default]
    Constant,
    /// Linear decay to zero over all epochs.
    Linear,
    /// Cosine annealing over all epochs.
    Cosine,
    /// Multiply by `gamma` every `step_size` epochs.
    Step {
        /// Epochs between decays
        step_size: usize,
        /// Decay factor
        gamma: f64,
    },
}

/// Model-selection criterion evaluated on each epoch log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Monitor {
    /// No model selection.
    Off,
    /// Lower is better.
    Min(String),
    /// Higher is better.
    Max(String),
}

impl Default for Monitor {
    fn default() -> Self {
        Monitor::Min("val_loss".into())
    }
}

impl Monitor {
    /// Metric key and whether lower values are better.
    #[must_use]
    pub fn target(&self) -> Option<(&str, bool)> {
        match self {
            Monitor::Off => None,
            Monitor::Min(key) => Some((key.as_str(), true)),
            Monitor::Max(key) => Some((key.as_str(), false)),
        }
    }
}

impl TryFrom<String> for Monitor {
    type Error = ProbSegError;

    fn try_from(value: String) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("off") {
            return Ok(Monitor::Off);
        }
        match trimmed.split_once(char::is_whitespace) {
            Some(("min", key)) if !key.trim().is_empty() => Ok(Monitor::Min(key.trim().into())),
            Some(("max", key)) if !key.trim().is_empty() => Ok(Monitor::Max(key.trim().into())),
            _ => Err(ProbSegError::Config(format!(
                "monitor must be 'off', 'min <metric>' or 'max <metric>', got '{value}'"
            ))),
        }
    }
}

impl From<Monitor> for String {
    fn from(monitor: Monitor) -> Self {
        match monitor {
            Monitor::Off => "off".into(),
            Monitor::Min(key) => format!("min {key}"),
            Monitor::Max(key) => format!("max {key}"),
        }
    }
}

/// Training hyperparameters.
///
/// # Example
///
/// ```rust
/// use probseg_rs::TrainingConfig;
/// use probseg_rs::config::Objective;
///
/// let training = TrainingConfig {
///     epochs: 10,
///     batch_size: 2,
///     metrics_sample_count: 5,
///     objective: Objective::Elbo,
///     ..Default::default()
/// };
/// assert_eq!(training.metrics_sample_count, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// AdamW weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Learning rate scheduler: `cosine`, or `step: {step_size, gamma}`.
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub lr_scheduler: LrScheduler,

    /// Stochastic forward passes per validation batch.
    #[serde(default = "default_sample_count")]
    pub metrics_sample_count: usize,

    /// Training objective.
    #[serde(default)]
    pub objective: Objective,

    /// Supervised criterion.
    #[serde(default)]
    pub criterion: CriterionKind,

    /// Iteration-based epochs: batches per epoch, cycling the loader.
    #[serde(default)]
    pub len_epoch: Option<usize>,

    /// Save a checkpoint every N epochs (0 disables periodic saves).
    #[serde(default = "default_save_period")]
    pub save_period: usize,

    /// Model-selection criterion, e.g. `min val_loss`.
    #[serde(default)]
    pub monitor: Monitor,

    /// Stop after this many epochs without improvement.
    #[serde(default)]
    pub early_stop: Option<usize>,

    /// Metrics evaluated each epoch.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<Metric>,
}

fn default_epochs() -> usize {
    10
}
fn default_batch_size() -> usize {
    4
}
fn default_lr() -> f64 {
    1e-4
}
fn default_sample_count() -> usize {
    5
}
fn default_save_period() -> usize {
    5
}
fn default_metrics() -> Vec<Metric> {
    use crate::metrics::{EnsembleMetric, SingleMetric};
    vec![
        Metric::Single(SingleMetric::Dice),
        Metric::Single(SingleMetric::PixelAccuracy),
        Metric::Ensemble(EnsembleMetric::Ged),
        Metric::Ensemble(EnsembleMetric::IouSamplesPerLabel),
        Metric::Ensemble(EnsembleMetric::SampleVariance),
    ]
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            weight_decay: 0.0,
            lr_scheduler: LrScheduler::Constant,
            metrics_sample_count: default_sample_count(),
            objective: Objective::Supervised,
            criterion: CriterionKind::CrossEntropy,
            len_epoch: None,
            save_period: default_save_period(),
            monitor: Monitor::default(),
            early_stop: None,
            metrics: default_metrics(),
        }
    }
}

/// Synthetic blob data used when no dataset file is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Number of training examples.
    #[serde(default = "default_synthetic_samples")]
    pub num_samples: usize,
    /// Number of validation examples.
    #[serde(default = "default_synthetic_valid")]
    pub num_valid: usize,
    /// Image height.
    #[serde(default = "default_synthetic_size")]
    pub height: usize,
    /// Image width.
    #[serde(default = "default_synthetic_size")]
    pub width: usize,
    /// Annotations per example. Above one, labels are `[N, R, H, W]` and
    /// each rater draws the disks with a slightly different radius.
    #[serde(default = "default_synthetic_raters")]
    pub num_raters: usize,
}

fn default_synthetic_samples() -> usize {
    32
}
fn default_synthetic_valid() -> usize {
    8
}
fn default_synthetic_size() -> usize {
    32
}
fn default_synthetic_raters() -> usize {
    1
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_samples: default_synthetic_samples(),
            num_valid: default_synthetic_valid(),
            height: default_synthetic_size(),
            width: default_synthetic_size(),
            num_raters: default_synthetic_raters(),
        }
    }
}

/// Dataset configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Training set (`.safetensors` with `images` and `labels`).
    #[serde(default)]
    pub train_path: Option<String>,

    /// Validation set in the same format.
    #[serde(default)]
    pub valid_path: Option<String>,

    /// Shuffle training batches each epoch.
    #[serde(default = "default_true")]
    pub shuffle: bool,

    /// Synthetic data parameters (used when `train_path` is unset).
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

/// Validation grid rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationConfig {
    /// Render a grid after each validation epoch.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum examples (rows) per grid.
    #[serde(default = "default_max_examples")]
    pub max_examples: usize,

    /// Output pixels per label pixel.
    #[serde(default = "default_cell_size")]
    pub cell_size: u32,
}

fn default_max_examples() -> usize {
    4
}
fn default_cell_size() -> u32 {
    2
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_examples: default_max_examples(),
            cell_size: default_cell_size(),
        }
    }
}

/// Compute device selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSpec {
    /// CUDA device 0 when compiled with `cuda` and available, else CPU.
    #[default]
    Auto,
    /// Always CPU.
    Cpu,
    /// A specific CUDA ordinal.
    Cuda(usize),
}

impl TryFrom<String> for DeviceSpec {
    type Error = ProbSegError;

    fn try_from(value: String) -> Result<Self> {
        let lowered = value.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "auto" => Ok(DeviceSpec::Auto),
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" => Ok(DeviceSpec::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(DeviceSpec::Cuda)
                .ok_or_else(|| ProbSegError::Config(format!("unknown device '{value}'"))),
        }
    }
}

impl From<DeviceSpec> for String {
    fn from(spec: DeviceSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Auto => write!(f, "auto"),
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl DeviceSpec {
    /// Resolve to a concrete candle device.
    ///
    /// `Auto` falls back to CPU with a warning; an explicit `Cuda` request
    /// that cannot be satisfied is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly requested CUDA device is unavailable.
    pub fn resolve(&self) -> Result<Device> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => match Device::cuda_if_available(*ordinal)? {
                device @ Device::Cuda(_) => {
                    tracing::info!("Compute device: CUDA (device {})", ordinal);
                    Ok(device)
                }
                _ => Err(ProbSegError::Config(format!(
                    "CUDA device {ordinal} requested but not available"
                ))),
            },
            DeviceSpec::Auto => match Device::cuda_if_available(0) {
                Ok(device @ Device::Cuda(_)) => {
                    tracing::info!("Compute device: CUDA (device 0)");
                    Ok(device)
                }
                Ok(_) => {
                    tracing::warn!("CUDA not available; running on CPU");
                    Ok(Device::Cpu)
                }
                Err(err) => {
                    tracing::warn!("CUDA init failed ({err}); running on CPU");
                    Ok(Device::Cpu)
                }
            },
        }
    }
}

impl ProbSegConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"quicknat-28"` - 28-class whole-brain setup (1 channel, latent 6)
    /// - `"lidc"` - binary lesion segmentation
    /// - `"tiny"` - small network on synthetic data, for smoke tests
    ///
    /// # Errors
    ///
    /// Returns an error for unknown preset names.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "quicknat-28" => Ok(Self::quicknat_28_preset()),
            "lidc" => Ok(Self::lidc_preset()),
            "tiny" => Ok(Self::tiny_preset()),
            _ => Err(ProbSegError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// 28-class preset matching the reference architecture.
    #[must_use]
    pub fn quicknat_28_preset() -> Self {
        Self {
            model: ModelConfig::default(),
            backbone: BackboneConfig::default(),
            training: TrainingConfig::default(),
            dataset: DatasetConfig::default(),
            visualization: VisualizationConfig::default(),
            output_dir: "./outputs/quicknat-28".into(),
            seed: default_seed(),
            device: DeviceSpec::Auto,
        }
    }

    /// Binary lesion segmentation preset with four annotators per image.
    #[must_use]
    pub fn lidc_preset() -> Self {
        Self {
            model: ModelConfig {
                num_classes: 2,
                ..Default::default()
            },
            backbone: BackboneConfig {
                filters: vec![32, 64, 128],
                convs_per_stage: 2,
            },
            training: TrainingConfig {
                batch_size: 8,
                metrics_sample_count: 16,
                ..Default::default()
            },
            dataset: DatasetConfig {
                synthetic: SyntheticConfig {
                    num_raters: 4,
                    ..Default::default()
                },
                ..Default::default()
            },
            visualization: VisualizationConfig::default(),
            output_dir: "./outputs/lidc".into(),
            seed: default_seed(),
            device: DeviceSpec::Auto,
        }
    }

    /// Small network for smoke tests on synthetic data.
    #[must_use]
    pub fn tiny_preset() -> Self {
        Self {
            model: ModelConfig {
                num_channels: 1,
                num_classes: 3,
                latent_dim: 2,
                filter_counts: vec![3, 8, 16],
                convs_per_block: 1,
                convs_per_fcomb_block: 3,
                ..Default::default()
            },
            backbone: BackboneConfig {
                filters: vec![8, 16],
                convs_per_stage: 1,
            },
            training: TrainingConfig {
                epochs: 2,
                batch_size: 2,
                learning_rate: 1e-3,
                metrics_sample_count: 3,
                save_period: 1,
                ..Default::default()
            },
            dataset: DatasetConfig {
                synthetic: SyntheticConfig {
                    num_samples: 6,
                    num_valid: 3,
                    height: 12,
                    width: 12,
                    num_raters: 1,
                },
                ..Default::default()
            },
            visualization: VisualizationConfig {
                max_examples: 2,
                ..Default::default()
            },
            output_dir: "./outputs/tiny".into(),
            seed: default_seed(),
            device: DeviceSpec::Cpu,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ProbSegError::Config` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        if m.num_channels == 0 {
            return Err(ProbSegError::Config("model.num_channels must be > 0".into()));
        }
        if m.num_classes == 0 {
            return Err(ProbSegError::Config("model.num_classes must be > 0".into()));
        }
        if m.latent_dim == 0 {
            return Err(ProbSegError::Config("model.latent_dim must be > 0".into()));
        }
        if m.filter_counts.is_empty() {
            return Err(ProbSegError::Config(
                "model.filter_counts must not be empty".into(),
            ));
        }
        if m.filter_counts.iter().any(|&f| f == 0) {
            return Err(ProbSegError::Config(
                "model.filter_counts entries must be > 0".into(),
            ));
        }
        if m.convs_per_block == 0 {
            return Err(ProbSegError::Config(
                "model.convs_per_block must be > 0".into(),
            ));
        }
        if m.convs_per_fcomb_block < 2 {
            return Err(ProbSegError::Config(
                "model.convs_per_fcomb_block must be >= 2".into(),
            ));
        }
        if !m.beta.is_finite() || m.beta < 0.0 {
            return Err(ProbSegError::Config("model.beta must be finite and >= 0".into()));
        }

        if self.backbone.filters.is_empty() || self.backbone.filters.iter().any(|&f| f == 0) {
            return Err(ProbSegError::Config(
                "backbone.filters must be non-empty with positive entries".into(),
            ));
        }
        if self.backbone.convs_per_stage == 0 {
            return Err(ProbSegError::Config(
                "backbone.convs_per_stage must be > 0".into(),
            ));
        }

        let t = &self.training;
        if t.epochs == 0 {
            return Err(ProbSegError::Config("training.epochs must be > 0".into()));
        }
        if t.batch_size == 0 {
            return Err(ProbSegError::Config("training.batch_size must be > 0".into()));
        }
        if t.metrics_sample_count == 0 {
            return Err(ProbSegError::Config(
                "training.metrics_sample_count must be > 0".into(),
            ));
        }
        if !(t.learning_rate > 0.0) {
            return Err(ProbSegError::Config("training.learning_rate must be > 0".into()));
        }
        if t.len_epoch == Some(0) {
            return Err(ProbSegError::Config("training.len_epoch must be > 0".into()));
        }
        if let LrScheduler::Step { step_size: 0, .. } = t.lr_scheduler {
            return Err(ProbSegError::Config(
                "training.lr_scheduler.step_size must be > 0".into(),
            ));
        }

        if self.visualization.max_examples == 0 || self.visualization.cell_size == 0 {
            return Err(ProbSegError::Config(
                "visualization.max_examples and cell_size must be > 0".into(),
            ));
        }

        if self.dataset.train_path.is_none() {
            let s = &self.dataset.synthetic;
            if s.num_samples == 0 || s.height == 0 || s.width == 0 || s.num_raters == 0 {
                return Err(ProbSegError::Config(
                    "dataset.synthetic needs num_samples, height, width and num_raters > 0"
                        .into(),
                ));
            }
        }

        Ok(())
    }
}
