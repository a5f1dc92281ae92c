//! Supervised losses over class logits.

use candle_core::{DType, Tensor, D};

use crate::config::CriterionKind;
use crate::error::{ProbSegError, Result};

fn check_target(logits: &Tensor, target: &Tensor) -> Result<(usize, usize, usize, usize)> {
    let (b, c, h, w) = logits.dims4()?;
    if target.dims() != &[b, h, w] {
        return Err(ProbSegError::shape_mismatch(
            format!("target [{b}, {h}, {w}]"),
            format!("{:?}", target.dims()),
        ));
    }
    Ok((b, c, h, w))
}

/// Mean pixel-wise cross-entropy between logits `[B, C, H, W]` and integer
/// labels `[B, H, W]`.
///
/// # Errors
///
/// Returns `ShapeMismatch` if the target does not match the logits.
pub fn pixel_cross_entropy(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = check_target(logits, target)?;
    let flat = logits.permute((0, 2, 3, 1))?.reshape((b * h * w, c))?;
    let labels = target.to_dtype(DType::U32)?.flatten_all()?;
    Ok(candle_nn::loss::cross_entropy(&flat, &labels)?)
}

/// One-hot `[B, C, H, W]` f32 encoding of `[B, H, W]` labels.
///
/// # Errors
///
/// Propagates candle errors.
pub fn one_hot(target: &Tensor, num_classes: usize) -> Result<Tensor> {
    let classes = Tensor::arange(0u32, num_classes as u32, target.device())?
        .reshape((1, num_classes, 1, 1))?;
    let labels = target.to_dtype(DType::U32)?.unsqueeze(1)?;
    Ok(labels.broadcast_eq(&classes)?.to_dtype(DType::F32)?)
}

/// Soft multi-class dice loss: `1 - mean_c (2|P∩G| + eps) / (|P| + |G| + eps)`
/// over softmax probabilities.
///
/// # Errors
///
/// Returns `ShapeMismatch` if the target does not match the logits.
pub fn soft_dice_loss(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let (_, c, _, _) = check_target(logits, target)?;
    let eps = 1.0;
    let probs = candle_nn::ops::softmax(logits, 1)?;
    let truth = one_hot(target, c)?;

    let sum_bhw = |t: &Tensor| -> Result<Tensor> { Ok(t.sum(0)?.sum(D::Minus1)?.sum(D::Minus1)?) };
    let intersection = sum_bhw(&probs.mul(&truth)?)?;
    let denom = (sum_bhw(&probs)? + sum_bhw(&truth)?)?;
    let dice = ((intersection * 2.0)? + eps)?.div(&(denom + eps)?)?;
    Ok(dice.mean_all()?.affine(-1.0, 1.0)?)
}

/// Configured supervised criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Criterion {
    kind: CriterionKind,
}

impl Criterion {
    /// Criterion of the given kind.
    pub fn new(kind: CriterionKind) -> Self {
        Self { kind }
    }

    /// Scalar loss between logits `[B, C, H, W]` and labels `[B, H, W]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the target does not match the logits.
    pub fn compute(&self, logits: &Tensor, target: &Tensor) -> Result<Tensor> {
        match self.kind {
            CriterionKind::CrossEntropy => pixel_cross_entropy(logits, target),
            CriterionKind::Dice => soft_dice_loss(logits, target),
            CriterionKind::CrossEntropyDice => {
                Ok((pixel_cross_entropy(logits, target)? + soft_dice_loss(logits, target)?)?)
            }
        }
    }
}

/// `criterion(reconstruction, target) + beta * mean(kl)`.
///
/// # Errors
///
/// Returns an error if `kl` is not `[B]` or the criterion fails.
pub fn elbo_loss(
    criterion: &Criterion,
    reconstruction: &Tensor,
    target: &Tensor,
    kl: &Tensor,
    beta: f64,
) -> Result<Tensor> {
    let b = reconstruction.dims()[0];
    if kl.dims() != &[b] {
        return Err(ProbSegError::shape_mismatch(
            format!("kl [{b}]"),
            format!("{:?}", kl.dims()),
        ));
    }
    let recon = criterion.compute(reconstruction, target)?;
    Ok((recon + (kl.mean_all()? * beta)?)?)
}
