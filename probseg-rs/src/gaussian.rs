//! Diagonal Gaussian latent distributions and the convolutional head that
//! produces them.

use std::f64::consts::PI;

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::component::{Component, ParamScope};
use crate::config::ModelConfig;
use crate::encoder::ConvEncoder;
use crate::error::{ProbSegError, Result};

/// How a latent sample was drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// `mean + scale * eps`; gradients reach the distribution parameters.
    Reparameterized,
    /// Detached draw with no gradient path.
    Plain,
}

/// A latent vector batch `[B, latent_dim]` with its provenance.
#[derive(Debug, Clone)]
pub struct LatentSample {
    z: Tensor,
    provenance: Provenance,
}

impl LatentSample {
    /// The latent tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.z
    }

    /// Consume into the latent tensor.
    pub fn into_tensor(self) -> Tensor {
        self.z
    }

    /// How the sample was drawn.
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }
}

/// Batch of axis-aligned Gaussians over `R^d`, parameterized by mean and
/// log-scale. Realized scale is `exp(log_scale)` and therefore positive.
#[derive(Debug, Clone)]
pub struct DiagonalGaussian {
    mean: Tensor,
    log_scale: Tensor,
}

impl DiagonalGaussian {
    /// Build from `[B, d]` mean and log-scale tensors.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the two tensors differ in shape or are not 2-D.
    pub fn new(mean: Tensor, log_scale: Tensor) -> Result<Self> {
        if mean.rank() != 2 || mean.dims() != log_scale.dims() {
            return Err(ProbSegError::shape_mismatch(
                format!("matching [B, d] mean and log-scale, mean {:?}", mean.dims()),
                format!("{:?}", log_scale.dims()),
            ));
        }
        Ok(Self { mean, log_scale })
    }

    /// Mean, `[B, d]`.
    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Log-scale, `[B, d]`.
    pub fn log_scale(&self) -> &Tensor {
        &self.log_scale
    }

    /// Standard deviation `exp(log_scale)`, `[B, d]`.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn scale(&self) -> Result<Tensor> {
        Ok(self.log_scale.exp()?)
    }

    /// Batch size.
    pub fn batch_size(&self) -> usize {
        self.mean.dims()[0]
    }

    /// Latent dimensionality.
    pub fn latent_dim(&self) -> usize {
        self.mean.dims()[1]
    }

    fn standard_normal<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Tensor> {
        let n = self.mean.elem_count();
        let eps: Vec<f32> = (0..n).map(|_| StandardNormal.sample(rng)).collect();
        Ok(Tensor::from_vec(eps, self.mean.shape(), self.mean.device())?)
    }

    /// Reparameterized draw `mean + exp(log_scale) * eps`.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn rsample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<LatentSample> {
        let eps = self.standard_normal(rng)?;
        let z = (&self.mean + self.scale()?.mul(&eps)?)?;
        Ok(LatentSample {
            z,
            provenance: Provenance::Reparameterized,
        })
    }

    /// Draw without a gradient path.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<LatentSample> {
        let eps = self.standard_normal(rng)?;
        let z = (self.mean.detach() + self.log_scale.detach().exp()?.mul(&eps)?)?;
        Ok(LatentSample {
            z,
            provenance: Provenance::Plain,
        })
    }

    /// Log-density of `z` (`[B, d]`), summed over dimensions, `[B]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `z` does not match the distribution shape.
    pub fn log_prob(&self, z: &Tensor) -> Result<Tensor> {
        if z.dims() != self.mean.dims() {
            return Err(ProbSegError::shape_mismatch(
                format!("{:?}", self.mean.dims()),
                format!("{:?}", z.dims()),
            ));
        }
        let var2 = (self.log_scale.affine(2.0, 0.0)?.exp()? * 2.0)?;
        let sq = z.sub(&self.mean)?.sqr()?.div(&var2)?;
        let log_norm = 0.5 * (2.0 * PI).ln();
        let per_dim = ((sq + &self.log_scale)? + log_norm)?.neg()?;
        Ok(per_dim.sum(1)?)
    }

    /// Closed-form `KL(self || other)` per example, `[B]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the two distributions differ in shape.
    pub fn kl_divergence(&self, other: &DiagonalGaussian) -> Result<Tensor> {
        if self.mean.dims() != other.mean.dims() {
            return Err(ProbSegError::shape_mismatch(
                format!("{:?}", other.mean.dims()),
                format!("{:?}", self.mean.dims()),
            ));
        }
        let var_q = self.log_scale.affine(2.0, 0.0)?.exp()?;
        let var_p = other.log_scale.affine(2.0, 0.0)?.exp()?;
        let mean_sq = self.mean.sub(&other.mean)?.sqr()?;
        let ratio = (var_q + mean_sq)?.div(&(var_p * 2.0)?)?;
        let per_dim = ((other.log_scale.sub(&self.log_scale)? + ratio)? - 0.5)?;
        Ok(per_dim.sum(1)?)
    }

    /// Copy with no gradient path to the producing network.
    pub fn detach(&self) -> Self {
        Self {
            mean: self.mean.detach(),
            log_scale: self.log_scale.detach(),
        }
    }

    /// Fail with `NumericDegeneracy` if any log-scale entry is NaN or infinite.
    ///
    /// # Errors
    ///
    /// Returns `NumericDegeneracy` on non-finite values.
    pub fn check_finite(&self, label: &str) -> Result<()> {
        let values: Vec<f32> = self.log_scale.flatten_all()?.to_vec1()?;
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(ProbSegError::NumericDegeneracy(format!(
                "{label} log-scale contains {bad}"
            )));
        }
        Ok(())
    }
}

/// Which distribution a head parameterizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaussianRole {
    /// Image only.
    Prior,
    /// Image concatenated with the ground-truth mask.
    Posterior,
}

impl GaussianRole {
    /// Variable-map prefix for this role.
    pub fn prefix(self) -> &'static str {
        match self {
            GaussianRole::Prior => "prior",
            GaussianRole::Posterior => "posterior",
        }
    }
}

/// Conv encoder followed by a global mean and a 1x1 convolution to
/// `2 * latent_dim` channels, split into mean and log-scale.
pub struct AxisAlignedConvGaussian {
    role: GaussianRole,
    encoder: ConvEncoder,
    head: Conv2d,
    latent_dim: usize,
    scope: ParamScope,
}

impl AxisAlignedConvGaussian {
    /// Build a prior or posterior head.
    ///
    /// The posterior encoder takes one extra input channel for the mask.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be created.
    pub fn new(
        config: &ModelConfig,
        role: GaussianRole,
        vb: VarBuilder,
        scope: ParamScope,
    ) -> Result<Self> {
        let filters = config.effective_filter_counts();
        let input_channels = match role {
            GaussianRole::Prior => config.num_channels,
            GaussianRole::Posterior => config.num_channels + 1,
        };
        let encoder = ConvEncoder::new(
            input_channels,
            &filters,
            config.convs_per_block,
            config.padding,
            vb.pp("encoder"),
            scope.child("encoder"),
        )?;
        let last = filters.last().copied().unwrap_or(config.num_classes);
        let head = conv2d(
            last,
            2 * config.latent_dim,
            1,
            Conv2dConfig::default(),
            vb.pp("head"),
        )?;
        Ok(Self {
            role,
            encoder,
            head,
            latent_dim: config.latent_dim,
            scope,
        })
    }

    /// Prior or posterior.
    pub fn role(&self) -> GaussianRole {
        self.role
    }

    /// The underlying encoder.
    pub fn encoder(&self) -> &ConvEncoder {
        &self.encoder
    }

    /// Encode `image` (and `mask` for the posterior) into a distribution.
    ///
    /// `mask` is `[B, 1, H, W]` and is concatenated on the channel axis.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` if the mask presence does not match the role,
    /// `ShapeMismatch` if the mask does not line up with the image.
    pub fn encode(&self, image: &Tensor, mask: Option<&Tensor>) -> Result<DiagonalGaussian> {
        let input = match (self.role, mask) {
            (GaussianRole::Posterior, Some(mask)) => {
                let (b, _, h, w) = image.dims4()?;
                if mask.dims() != &[b, 1, h, w] {
                    return Err(ProbSegError::shape_mismatch(
                        format!("mask [{b}, 1, {h}, {w}]"),
                        format!("{:?}", mask.dims()),
                    ));
                }
                Tensor::cat(&[image, mask], 1)?
            }
            (GaussianRole::Posterior, None) => {
                return Err(ProbSegError::precondition(
                    "posterior encoding requires a mask",
                ))
            }
            (GaussianRole::Prior, None) => image.clone(),
            (GaussianRole::Prior, Some(_)) => {
                return Err(ProbSegError::precondition(
                    "prior encoding takes the image only",
                ))
            }
        };

        let encoding = self.encoder.forward(&input)?;
        let pooled = encoding.mean_keepdim(2)?.mean_keepdim(3)?;
        // [B, 2d, 1, 1] -> [B, 2d]; squeeze the trailing axes so B = 1 survives
        let mu_log_sigma = self.head.forward(&pooled)?.squeeze(3)?.squeeze(2)?;
        let mean = mu_log_sigma.narrow(1, 0, self.latent_dim)?.contiguous()?;
        let log_scale = mu_log_sigma
            .narrow(1, self.latent_dim, self.latent_dim)?
            .contiguous()?;
        DiagonalGaussian::new(mean, log_scale)
    }
}

impl Component for AxisAlignedConvGaussian {
    fn scope(&self) -> &ParamScope {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn gaussian(mean: &[f32], log_scale: &[f32]) -> DiagonalGaussian {
        let d = mean.len();
        DiagonalGaussian::new(
            Tensor::from_slice(mean, (1, d), &Device::Cpu).unwrap(),
            Tensor::from_slice(log_scale, (1, d), &Device::Cpu).unwrap(),
        )
        .unwrap()
    }

    fn small_config() -> ModelConfig {
        ModelConfig {
            num_channels: 1,
            num_classes: 3,
            latent_dim: 2,
            filter_counts: vec![3, 4],
            convs_per_block: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_scale_is_positive_for_extreme_log_scales() -> Result<()> {
        let g = gaussian(&[0.0; 5], &[-80.0, -10.0, 0.0, 10.0, 80.0]);
        let scale: Vec<f32> = g.scale()?.flatten_all()?.to_vec1()?;
        assert!(scale.iter().all(|&s| s > 0.0), "{scale:?}");
        Ok(())
    }

    #[test]
    fn test_kl_with_itself_is_zero() -> Result<()> {
        let g = gaussian(&[0.3, -1.2, 4.0], &[0.5, -2.0, 1.0]);
        let kl: Vec<f32> = g.kl_divergence(&g)?.to_vec1()?;
        assert!(kl[0].abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_kl_non_negative_random_pairs() -> Result<()> {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..100 {
            let mut draw = |scale: f32| -> Vec<f32> {
                (0..6).map(|_| rng.gen_range(-scale..scale)).collect()
            };
            let q = gaussian(&draw(3.0), &draw(2.0));
            let p = gaussian(&draw(3.0), &draw(2.0));
            let kl = q.kl_divergence(&p)?.to_vec1::<f32>()?[0];
            assert!(kl >= -1e-5, "kl = {kl}");
        }
        Ok(())
    }

    #[test]
    fn test_kl_matches_closed_form_1d() -> Result<()> {
        // KL(N(1, 1) || N(0, 4)) = ln 2 + (1 + 1) / 8 - 0.5
        let q = gaussian(&[1.0], &[0.0]);
        let p = gaussian(&[0.0], &[2f32.ln()]);
        let kl = q.kl_divergence(&p)?.to_vec1::<f32>()?[0];
        let expected = 2f32.ln() + 0.25 - 0.5;
        assert!((kl - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_log_prob_standard_normal_at_zero() -> Result<()> {
        let g = gaussian(&[0.0, 0.0], &[0.0, 0.0]);
        let z = Tensor::zeros((1, 2), DType::F32, &Device::Cpu)?;
        let lp = g.log_prob(&z)?.to_vec1::<f32>()?[0];
        let expected = -(2.0 * PI).ln() as f32;
        assert!((lp - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_sample_provenance() -> Result<()> {
        let g = gaussian(&[0.0, 1.0], &[0.0, -1.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(g.rsample(&mut rng)?.provenance(), Provenance::Reparameterized);
        assert_eq!(g.sample(&mut rng)?.provenance(), Provenance::Plain);
        Ok(())
    }

    #[test]
    fn test_same_seed_same_draw() -> Result<()> {
        let g = gaussian(&[0.0, 1.0, 2.0], &[0.0, -1.0, 0.5]);
        let a: Vec<f32> = g
            .rsample(&mut ChaCha8Rng::seed_from_u64(5))?
            .tensor()
            .flatten_all()?
            .to_vec1()?;
        let b: Vec<f32> = g
            .rsample(&mut ChaCha8Rng::seed_from_u64(5))?
            .tensor()
            .flatten_all()?
            .to_vec1()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_non_finite_log_scale_detected() {
        let g = gaussian(&[0.0, 0.0], &[f32::NAN, 0.0]);
        assert!(matches!(
            g.check_finite("prior"),
            Err(ProbSegError::NumericDegeneracy(_))
        ));
    }

    #[test]
    fn test_head_batch_of_one() -> Result<()> {
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let prior = AxisAlignedConvGaussian::new(
            &config,
            GaussianRole::Prior,
            vb.pp("prior"),
            ParamScope::new(&varmap, "prior"),
        )?;
        let image = Tensor::randn(0f32, 1.0, (1, 1, 9, 9), &Device::Cpu)?;
        let dist = prior.encode(&image, None)?;
        assert_eq!(dist.mean().dims(), &[1, 2]);
        assert_eq!(dist.log_scale().dims(), &[1, 2]);
        Ok(())
    }

    #[test]
    fn test_posterior_takes_mask_channel() -> Result<()> {
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let posterior = AxisAlignedConvGaussian::new(
            &config,
            GaussianRole::Posterior,
            vb.pp("posterior"),
            ParamScope::new(&varmap, "posterior"),
        )?;
        assert_eq!(posterior.encoder().input_channels(), 2);

        let image = Tensor::randn(0f32, 1.0, (2, 1, 8, 8), &Device::Cpu)?;
        let mask = Tensor::ones((2, 1, 8, 8), DType::F32, &Device::Cpu)?;
        let dist = posterior.encode(&image, Some(&mask))?;
        assert_eq!(dist.mean().dims(), &[2, 2]);
        assert!(dist.mean().is_contiguous());
        assert!(dist.log_scale().is_contiguous());
        assert!(matches!(
            posterior.encode(&image, None),
            Err(ProbSegError::Precondition(_))
        ));
        Ok(())
    }
}
