//! Probabilistic segmenter: backbone + prior/posterior heads + feature combiner.
//!
//! The segmenter itself is stateless between calls. [`ProbabilisticSegmenter::forward`]
//! returns a [`StepContext`] holding the feature map and the latent
//! distributions of one step; `sample`, `reconstruct` and `kl_divergence`
//! consume that context. [`SegmenterSession`] wraps the same API with an
//! explicit state machine for callers that prefer the call-order style.
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use probseg_rs::model::{ForwardMode, ProbabilisticSegmenter, SampleMode};
//! use probseg_rs::ProbSegConfig;
//! use rand::SeedableRng;
//!
//! # fn main() -> probseg_rs::Result<()> {
//! let config = ProbSegConfig::from_preset("tiny")?;
//! let model = ProbabilisticSegmenter::new(&config.model, &config.backbone, &Device::Cpu)?;
//! let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
//!
//! let image = Tensor::randn(0f32, 1.0, (1, 1, 16, 16), &Device::Cpu)?;
//! let ctx = model.forward(&image, None, ForwardMode::Inference)?;
//! let logits = model.sample(&ctx, SampleMode::Test, &mut rng)?;
//! assert_eq!(logits.dims(), &[1, 3, 16, 16]);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use safetensors::SafeTensors;
use tracing::{info, warn};

use crate::backbone::{Backbone, SegNet};
use crate::component::{Component, ParamScope};
use crate::config::{BackboneConfig, ModelConfig, WeightInit};
use crate::error::{ProbSegError, Result};
use crate::fcomb::FeatureCombiner;
use crate::gaussian::{AxisAlignedConvGaussian, DiagonalGaussian, GaussianRole, LatentSample};
use crate::init::{BiasInit, ParamInitializer, BIAS_STD};

/// Metadata key holding the JSON model configuration.
pub const META_MODEL_CONFIG: &str = "probseg.model_config";
/// Metadata key holding the JSON backbone configuration.
pub const META_BACKBONE_CONFIG: &str = "probseg.backbone_config";
/// Metadata key holding the artifact format tag.
pub const META_FORMAT: &str = "probseg.format";
/// Current artifact format tag.
pub const FORMAT_TAG: &str = "probseg-safetensors-v1";

/// Tolerance below zero accepted for the analytic KL.
pub const KL_TOLERANCE: f32 = 1e-4;

/// Whether a forward pass builds the posterior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Image and mask available: prior and posterior.
    Training,
    /// Image only: prior.
    Inference,
}

/// How `sample` draws from the prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Reparameterized draw; gradients reach the prior.
    Train,
    /// Plain draw without a gradient path.
    Test,
}

/// Latent used to decode from the posterior.
#[derive(Debug, Clone)]
pub enum PosteriorDraw {
    /// Posterior mean, deterministic.
    Mean,
    /// Fresh reparameterized posterior draw.
    Sample,
    /// Caller-supplied latent `[B, latent_dim]`, used verbatim.
    Supplied(Tensor),
}

impl PosteriorDraw {
    /// Map the three-flag calling convention onto a draw.
    ///
    /// Exactly one of `use_posterior_mean`, `calculate_posterior` and a
    /// supplied sample must be selected.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` for ambiguous or empty selections.
    pub fn from_flags(
        use_posterior_mean: bool,
        calculate_posterior: bool,
        supplied: Option<Tensor>,
    ) -> Result<Self> {
        match (use_posterior_mean, calculate_posterior, supplied) {
            (true, false, None) => Ok(PosteriorDraw::Mean),
            (false, true, None) => Ok(PosteriorDraw::Sample),
            (false, false, Some(z)) => Ok(PosteriorDraw::Supplied(z)),
            (mean, sample, supplied) => Err(ProbSegError::precondition(format!(
                "exactly one posterior path must be selected \
                 (use_posterior_mean={mean}, calculate_posterior={sample}, supplied={})",
                supplied.is_some()
            ))),
        }
    }
}

/// KL estimator.
#[derive(Debug, Clone)]
pub enum KlEstimate {
    /// Closed form between the two diagonal Gaussians.
    Analytic,
    /// `log q(z) - log p(z)` at a posterior latent.
    MonteCarlo(PosteriorDraw),
}

/// Everything one forward pass produced.
///
/// Valid for exactly one step; a new `forward` call yields a new context.
#[derive(Debug, Clone)]
pub struct StepContext {
    features: Tensor,
    prior: DiagonalGaussian,
    posterior: Option<DiagonalGaussian>,
    mode: ForwardMode,
}

impl StepContext {
    /// Backbone feature map `[B, C0, H, W]`.
    ///
    /// This is the value `forward` hands back. It does not depend on any
    /// latent sample, so it is not a segmentation on its own.
    pub fn features(&self) -> &Tensor {
        &self.features
    }

    /// Prior distribution.
    pub fn prior(&self) -> &DiagonalGaussian {
        &self.prior
    }

    /// Posterior distribution, present after a training forward.
    pub fn posterior(&self) -> Option<&DiagonalGaussian> {
        self.posterior.as_ref()
    }

    /// Mode of the forward pass that produced this context.
    pub fn mode(&self) -> ForwardMode {
        self.mode
    }

    fn require_posterior(&self, op: &str) -> Result<&DiagonalGaussian> {
        self.posterior.as_ref().ok_or_else(|| {
            ProbSegError::precondition(format!(
                "{op} requires a posterior; call forward in training mode with a mask first"
            ))
        })
    }
}

/// Inference input: a raw array or a tensor on any device/dtype.
#[derive(Debug)]
pub enum ImageInput<'a> {
    /// Row-major values with an explicit shape `[H, W]`, `[C, H, W]` or `[B, C, H, W]`.
    Array {
        /// Pixel values
        data: &'a [f32],
        /// Array shape
        shape: &'a [usize],
    },
    /// Existing tensor of rank 2, 3 or 4.
    Tensor(&'a Tensor),
}

/// The full conditional VAE segmentation model.
pub struct ProbabilisticSegmenter {
    config: ModelConfig,
    backbone_config: Option<BackboneConfig>,
    varmap: VarMap,
    device: Device,
    backbone: Box<dyn Backbone>,
    prior: AxisAlignedConvGaussian,
    posterior: AxisAlignedConvGaussian,
    fcomb: FeatureCombiner,
}

impl ProbabilisticSegmenter {
    /// Build the model with a [`SegNet`] backbone and seeded initialization.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is inconsistent or a layer
    /// cannot be created.
    pub fn new(config: &ModelConfig, backbone: &BackboneConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let segnet = SegNet::new(
            backbone,
            config.num_channels,
            config.feature_channels(),
            vb.pp("backbone"),
            ParamScope::new(&varmap, "backbone"),
        )?;
        let model = Self::assemble(config, Some(backbone), varmap, device, Box::new(segnet))?;
        info!(
            "Built probabilistic segmenter: {} classes, latent {}, {} parameters",
            config.num_classes,
            config.latent_dim,
            model.num_parameters()?
        );
        Ok(model)
    }

    /// Build the model around a caller-provided backbone.
    ///
    /// `build_backbone` receives a builder scoped to `backbone` in the
    /// model's variable map so its parameters are trained and saved with the
    /// rest. Its output channel count must equal the first effective filter
    /// count. Such models cannot be [`save`](Self::save)d, since `load`
    /// only knows how to rebuild the built-in backbone.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the backbone channel count is wrong.
    pub fn with_backbone<F>(config: &ModelConfig, device: &Device, build_backbone: F) -> Result<Self>
    where
        F: FnOnce(VarBuilder, ParamScope) -> Result<Box<dyn Backbone>>,
    {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let backbone = build_backbone(vb.pp("backbone"), ParamScope::new(&varmap, "backbone"))?;
        Self::assemble(config, None, varmap, device, backbone)
    }

    fn assemble(
        config: &ModelConfig,
        backbone_config: Option<&BackboneConfig>,
        varmap: VarMap,
        device: &Device,
        backbone: Box<dyn Backbone>,
    ) -> Result<Self> {
        let expected = config.effective_filter_counts()[0];
        if backbone.out_channels() != expected {
            return Err(ProbSegError::shape_mismatch(
                format!("backbone with {expected} output channels"),
                format!("{}", backbone.out_channels()),
            ));
        }

        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let prior = AxisAlignedConvGaussian::new(
            config,
            GaussianRole::Prior,
            vb.pp("prior"),
            ParamScope::new(&varmap, "prior"),
        )?;
        let posterior = AxisAlignedConvGaussian::new(
            config,
            GaussianRole::Posterior,
            vb.pp("posterior"),
            ParamScope::new(&varmap, "posterior"),
        )?;
        let fcomb = FeatureCombiner::new(config, vb.pp("fcomb"), ParamScope::new(&varmap, "fcomb"))?;

        let mut init = ParamInitializer::new(config.init_seed);
        let bias = BiasInit::TruncatedNormal(BIAS_STD);
        init.init_convs(&varmap, "backbone", WeightInit::Default, bias)?;
        for role in [GaussianRole::Prior, GaussianRole::Posterior] {
            let prefix = role.prefix();
            init.init_convs(&varmap, &format!("{prefix}.encoder"), config.weight_init, bias)?;
            init.init_convs(
                &varmap,
                &format!("{prefix}.head"),
                WeightInit::Default,
                BiasInit::StandardNormal,
            )?;
        }
        init.init_convs(&varmap, "fcomb", config.fcomb_weight_init, bias)?;

        Ok(Self {
            config: config.clone(),
            backbone_config: backbone_config.cloned(),
            varmap,
            device: device.clone(),
            backbone,
            prior,
            posterior,
            fcomb,
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Device every parameter lives on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The shared variable map (for optimizers).
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Total scalar parameter count.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable map lock is poisoned.
    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self.backbone.scope().num_parameters()?
            + self.prior.scope().num_parameters()?
            + self.posterior.scope().num_parameters()?
            + self.fcomb.scope().num_parameters()?)
    }

    /// Switch every stage between training and inference behaviour.
    pub fn set_training(&mut self, training: bool) {
        self.backbone.set_training(training);
        self.prior.set_training(training);
        self.posterior.set_training(training);
        self.fcomb.set_training(training);
    }

    /// Whether the model is in training mode.
    pub fn is_training(&self) -> bool {
        self.backbone.is_training()
    }

    fn normalize_mask(&self, mask: &Tensor, image: &Tensor) -> Result<Tensor> {
        let (b, _, h, w) = image.dims4()?;
        let mask = match mask.rank() {
            3 => mask.unsqueeze(1)?,
            4 => mask.clone(),
            _ => {
                return Err(ProbSegError::shape_mismatch(
                    format!("mask [{b}, {h}, {w}] or [{b}, 1, {h}, {w}]"),
                    format!("{:?}", mask.dims()),
                ))
            }
        };
        if mask.dims() != &[b, 1, h, w] {
            return Err(ProbSegError::shape_mismatch(
                format!("mask [{b}, 1, {h}, {w}]"),
                format!("{:?}", mask.dims()),
            ));
        }
        Ok(mask.to_dtype(DType::F32)?.to_device(&self.device)?)
    }

    /// Run backbone and prior, plus the posterior in training mode.
    ///
    /// `mask` may be `[B, H, W]` or `[B, 1, H, W]` of any dtype. It is
    /// ignored in inference mode.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` for a training forward without a mask,
    /// `ShapeMismatch` for inconsistent shapes and `NumericDegeneracy` for
    /// non-finite log-scales when numeric checks are on.
    pub fn forward(
        &self,
        image: &Tensor,
        mask: Option<&Tensor>,
        mode: ForwardMode,
    ) -> Result<StepContext> {
        if image.rank() != 4 || image.dims()[1] != self.config.num_channels {
            return Err(ProbSegError::shape_mismatch(
                format!("image [B, {}, H, W]", self.config.num_channels),
                format!("{:?}", image.dims()),
            ));
        }

        let posterior = match mode {
            ForwardMode::Training => {
                let mask = mask.ok_or_else(|| {
                    ProbSegError::precondition("forward in training mode requires a mask")
                })?;
                let mask = self.normalize_mask(mask, image)?;
                Some(self.posterior.encode(image, Some(&mask))?)
            }
            ForwardMode::Inference => None,
        };
        let prior = self.prior.encode(image, None)?;
        let features = self.backbone.encode(image)?;

        let (b, _, h, w) = image.dims4()?;
        let expected = [b, self.config.feature_channels(), h, w];
        if features.dims() != &expected {
            return Err(ProbSegError::shape_mismatch(
                format!("feature map {expected:?}"),
                format!("{:?}", features.dims()),
            ));
        }

        if self.config.check_numerics {
            prior.check_finite("prior")?;
            if let Some(posterior) = &posterior {
                posterior.check_finite("posterior")?;
            }
        }

        Ok(StepContext {
            features,
            prior,
            posterior,
            mode,
        })
    }

    /// Draw a prior latent for `ctx`.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn draw_prior<R: Rng + ?Sized>(
        &self,
        ctx: &StepContext,
        mode: SampleMode,
        rng: &mut R,
    ) -> Result<LatentSample> {
        match mode {
            SampleMode::Train => ctx.prior.rsample(rng),
            SampleMode::Test => ctx.prior.sample(rng),
        }
    }

    /// Decode a prior sample into logits `[B, num_classes, H, W]`.
    ///
    /// # Errors
    ///
    /// Propagates shape and candle errors from the combiner.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        ctx: &StepContext,
        mode: SampleMode,
        rng: &mut R,
    ) -> Result<Tensor> {
        let z = self.draw_prior(ctx, mode, rng)?;
        self.fcomb.combine(&ctx.features, z.tensor())
    }

    fn posterior_latent<R: Rng + ?Sized>(
        posterior: &DiagonalGaussian,
        draw: &PosteriorDraw,
        rng: &mut R,
    ) -> Result<Tensor> {
        match draw {
            PosteriorDraw::Mean => Ok(posterior.mean().clone()),
            PosteriorDraw::Sample => Ok(posterior.rsample(rng)?.into_tensor()),
            PosteriorDraw::Supplied(z) => {
                if z.dims() != posterior.mean().dims() {
                    return Err(ProbSegError::shape_mismatch(
                        format!("latent {:?}", posterior.mean().dims()),
                        format!("{:?}", z.dims()),
                    ));
                }
                Ok(z.clone())
            }
        }
    }

    /// Decode a posterior latent into logits.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` if `ctx` has no posterior.
    pub fn reconstruct<R: Rng + ?Sized>(
        &self,
        ctx: &StepContext,
        draw: PosteriorDraw,
        rng: &mut R,
    ) -> Result<Tensor> {
        let posterior = ctx.require_posterior("reconstruct")?;
        let z = Self::posterior_latent(posterior, &draw, rng)?;
        self.fcomb.combine(&ctx.features, &z)
    }

    /// `KL(posterior || prior)` per example, `[B]`.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` if `ctx` has no posterior and
    /// `NumericDegeneracy` if the analytic value is negative beyond
    /// [`KL_TOLERANCE`] while numeric checks are on.
    pub fn kl_divergence<R: Rng + ?Sized>(
        &self,
        ctx: &StepContext,
        estimate: KlEstimate,
        rng: &mut R,
    ) -> Result<Tensor> {
        let posterior = ctx.require_posterior("kl_divergence")?;
        match estimate {
            KlEstimate::Analytic => {
                let kl = posterior.kl_divergence(&ctx.prior)?;
                if self.config.check_numerics {
                    let min = kl.min(0)?.to_scalar::<f32>()?;
                    if min < -KL_TOLERANCE {
                        return Err(ProbSegError::NumericDegeneracy(format!(
                            "analytic KL is negative ({min})"
                        )));
                    }
                }
                Ok(kl)
            }
            KlEstimate::MonteCarlo(draw) => {
                let z = Self::posterior_latent(posterior, &draw, rng)?;
                Ok(posterior.log_prob(&z)?.sub(&ctx.prior.log_prob(&z)?)?)
            }
        }
    }

    fn input_tensor(&self, input: ImageInput<'_>) -> Result<Tensor> {
        let tensor = match input {
            ImageInput::Array { data, shape } => {
                let expected: usize = shape.iter().product();
                if expected != data.len() {
                    return Err(ProbSegError::shape_mismatch(
                        format!("{expected} values for shape {shape:?}"),
                        format!("{} values", data.len()),
                    ));
                }
                Tensor::from_slice(data, shape, &self.device)?
            }
            ImageInput::Tensor(t) => t.to_dtype(DType::F32)?.to_device(&self.device)?,
        };
        let tensor = match tensor.rank() {
            2 => tensor.unsqueeze(0)?.unsqueeze(0)?,
            3 => tensor.unsqueeze(0)?,
            4 => tensor,
            _ => {
                return Err(ProbSegError::shape_mismatch(
                    "image of rank 2, 3 or 4",
                    format!("{:?}", tensor.dims()),
                ))
            }
        };
        Ok(tensor)
    }

    /// Inference: forward without mask, one plain prior draw, arg-max over
    /// classes. Returns `u32` labels `[H, W]` for a single image, otherwise
    /// `[B, H, W]`.
    ///
    /// Batch-norm layers run in whatever mode the model is in; call
    /// `set_training(false)` first when the model was just trained.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` for malformed input.
    pub fn predict<R: Rng + ?Sized>(&self, input: ImageInput<'_>, rng: &mut R) -> Result<Tensor> {
        let image = self.input_tensor(input)?;
        let ctx = self.forward(&image, None, ForwardMode::Inference)?;
        let logits = self.sample(&ctx, SampleMode::Test, rng)?;
        let labels = logits.argmax(1)?;
        if labels.dims()[0] == 1 {
            Ok(labels.squeeze(0)?)
        } else {
            Ok(labels)
        }
    }

    /// Save architecture and parameters to one safetensors file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let backbone_config = self.backbone_config.as_ref().ok_or_else(|| {
            ProbSegError::Checkpoint("models with a custom backbone cannot be saved".into())
        })?;
        let tensors: Vec<(String, Tensor)> = {
            let data = self
                .varmap
                .data()
                .lock()
                .map_err(|_| ProbSegError::Checkpoint("variable map lock poisoned".into()))?;
            let mut entries: Vec<(String, Tensor)> = data
                .iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };

        let mut metadata = HashMap::new();
        metadata.insert(META_MODEL_CONFIG.to_string(), serde_json::to_string(&self.config)?);
        metadata.insert(
            META_BACKBONE_CONFIG.to_string(),
            serde_json::to_string(backbone_config)?,
        );
        metadata.insert(META_FORMAT.to_string(), FORMAT_TAG.to_string());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        safetensors::tensor::serialize_to_file(tensors, &Some(metadata), path)?;
        info!("Saved model to {}", path.display());
        Ok(())
    }

    /// Rebuild a model saved with [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns `Checkpoint` if the metadata is missing or a parameter is
    /// absent or mis-shaped.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let buffer = std::fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&buffer)?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| ProbSegError::Checkpoint("artifact has no metadata".into()))?;

        match metadata.get(META_FORMAT).map(String::as_str) {
            Some(FORMAT_TAG) => {}
            other => {
                return Err(ProbSegError::Checkpoint(format!(
                    "unsupported artifact format {other:?}"
                )))
            }
        }
        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| ProbSegError::Checkpoint(format!("missing metadata '{key}'")))
        };
        let config: ModelConfig = serde_json::from_str(field(META_MODEL_CONFIG)?)?;
        let backbone: BackboneConfig = serde_json::from_str(field(META_BACKBONE_CONFIG)?)?;

        let model = Self::new(&config, &backbone, device)?;
        let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
        {
            let data = model
                .varmap
                .data()
                .lock()
                .map_err(|_| ProbSegError::Checkpoint("variable map lock poisoned".into()))?;
            for (name, var) in data.iter() {
                let tensor = tensors
                    .get(name)
                    .ok_or_else(|| ProbSegError::Checkpoint(format!("missing parameter '{name}'")))?;
                if tensor.dims() != var.dims() {
                    return Err(ProbSegError::Checkpoint(format!(
                        "parameter '{name}' has shape {:?}, expected {:?}",
                        tensor.dims(),
                        var.dims()
                    )));
                }
                var.set(&tensor.to_dtype(var.dtype())?)?;
            }
            let unused = tensors.keys().filter(|k| !data.contains_key(*k)).count();
            if unused > 0 {
                warn!("Ignored {} unknown tensors in {}", unused, path.display());
            }
        }
        info!("Loaded model from {}", path.display());
        Ok(model)
    }
}

/// Where a [`SegmenterSession`] is in its call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No forward pass yet.
    Uninitialized,
    /// A forward pass in the given mode has been run.
    Ready(ForwardMode),
}

/// Stateful wrapper caching the last [`StepContext`] and owning a seeded rng.
pub struct SegmenterSession {
    model: ProbabilisticSegmenter,
    context: Option<StepContext>,
    rng: ChaCha8Rng,
}

impl SegmenterSession {
    /// Wrap `model`, seeding latent draws with `seed`.
    pub fn new(model: ProbabilisticSegmenter, seed: u64) -> Self {
        Self {
            model,
            context: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// The wrapped model.
    pub fn model(&self) -> &ProbabilisticSegmenter {
        &self.model
    }

    /// Mutable access to the wrapped model; clears the cached context.
    pub fn model_mut(&mut self) -> &mut ProbabilisticSegmenter {
        self.context = None;
        &mut self.model
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.context
            .as_ref()
            .map_or(SessionState::Uninitialized, |ctx| SessionState::Ready(ctx.mode()))
    }

    /// Forward pass; replaces any cached context. Returns the backbone features.
    ///
    /// # Errors
    ///
    /// See [`ProbabilisticSegmenter::forward`].
    pub fn forward(&mut self, image: &Tensor, mask: Option<&Tensor>, training: bool) -> Result<Tensor> {
        let mode = if training {
            ForwardMode::Training
        } else {
            ForwardMode::Inference
        };
        self.context = None;
        let ctx = self.model.forward(image, mask, mode)?;
        let features = ctx.features().clone();
        self.context = Some(ctx);
        Ok(features)
    }

    fn context(&self, op: &str) -> Result<&StepContext> {
        self.context
            .as_ref()
            .ok_or_else(|| ProbSegError::precondition(format!("{op} called before forward")))
    }

    /// Decode a prior sample from the cached context.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` before the first forward.
    pub fn sample(&mut self, test_mode: bool) -> Result<Tensor> {
        let mode = if test_mode {
            SampleMode::Test
        } else {
            SampleMode::Train
        };
        let ctx = self
            .context
            .as_ref()
            .ok_or_else(|| ProbSegError::precondition("sample called before forward"))?;
        self.model.sample(ctx, mode, &mut self.rng)
    }

    /// Decode from the cached posterior.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` before a training forward or for ambiguous flags.
    pub fn reconstruct(
        &mut self,
        use_posterior_mean: bool,
        calculate_posterior: bool,
        supplied: Option<Tensor>,
    ) -> Result<Tensor> {
        self.context("reconstruct")?;
        let draw = PosteriorDraw::from_flags(use_posterior_mean, calculate_posterior, supplied)?;
        let ctx = self
            .context
            .as_ref()
            .ok_or_else(|| ProbSegError::precondition("reconstruct called before forward"))?;
        self.model.reconstruct(ctx, draw, &mut self.rng)
    }

    /// KL between the cached posterior and prior.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` before a training forward.
    pub fn kl_divergence(
        &mut self,
        analytic: bool,
        calculate_posterior: bool,
        supplied: Option<Tensor>,
    ) -> Result<Tensor> {
        self.context("kl_divergence")?;
        let estimate = if analytic {
            KlEstimate::Analytic
        } else {
            KlEstimate::MonteCarlo(PosteriorDraw::from_flags(false, calculate_posterior, supplied)?)
        };
        let ctx = self
            .context
            .as_ref()
            .ok_or_else(|| ProbSegError::precondition("kl_divergence called before forward"))?;
        self.model.kl_divergence(ctx, estimate, &mut self.rng)
    }

    /// Forget the cached context.
    pub fn reset(&mut self) {
        self.context = None;
    }
}
