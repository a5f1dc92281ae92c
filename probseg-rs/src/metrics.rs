//! Segmentation metrics and a running-average tracker.
//!
//! Metrics come in two kinds with different inputs: [`SingleMetric`]s score a
//! point estimate against the target, [`EnsembleMetric`]s score the full
//! sample ensemble. Names are resolved to the [`Metric`] enum when the
//! configuration is loaded, so the trainer dispatches on the variant.
//!
//! Ensemble metrics accept several annotations per example, so datasets with
//! more than one rater are scored against every annotation.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{ProbSegError, Result};

/// Metric computed on the point estimate (`[B, C, H, W]` scores).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SingleMetric {
    /// Mean dice over classes present in prediction or target.
    Dice,
    /// Fraction of correctly labelled pixels.
    PixelAccuracy,
    /// Mean intersection-over-union over classes present.
    Iou,
}

/// Metric computed on the sample ensemble (`[B, N, H, W]` labels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnsembleMetric {
    /// Squared generalized energy distance with `d = 1 - mIoU`:
    /// `2 E[d(s, y)] - E[d(s, s')] - E[d(y, y')]` over samples `s` and
    /// annotations `y`.
    ///
    /// Every expectation averages all pairs: `N * R` for the cross term,
    /// `N^2` and `R^2` for the self terms (the zero diagonal included), so a
    /// sample set equal to the annotation set scores exactly 0.
    Ged,
    /// Mean pairwise IoU between distinct samples, averaged over labels.
    IouSamplesPerLabel,
    /// Mean pairwise dice between distinct samples.
    DiceAgreementInSamples,
    /// Mean per-pixel variance of the one-hot sample labels.
    SampleVariance,
}

/// A configured metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Metric {
    /// Point-estimate metric.
    Single(SingleMetric),
    /// Ensemble metric.
    Ensemble(EnsembleMetric),
}

impl Metric {
    /// Log key of the metric.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Single(SingleMetric::Dice) => "dice",
            Metric::Single(SingleMetric::PixelAccuracy) => "pixel_accuracy",
            Metric::Single(SingleMetric::Iou) => "iou",
            Metric::Ensemble(EnsembleMetric::Ged) => "ged",
            Metric::Ensemble(EnsembleMetric::IouSamplesPerLabel) => "iou_samples_per_label",
            Metric::Ensemble(EnsembleMetric::DiceAgreementInSamples) => {
                "dice_agreement_in_samples"
            }
            Metric::Ensemble(EnsembleMetric::SampleVariance) => "sample_variance",
        }
    }

    /// All known metrics.
    pub fn all() -> [Metric; 7] {
        [
            Metric::Single(SingleMetric::Dice),
            Metric::Single(SingleMetric::PixelAccuracy),
            Metric::Single(SingleMetric::Iou),
            Metric::Ensemble(EnsembleMetric::Ged),
            Metric::Ensemble(EnsembleMetric::IouSamplesPerLabel),
            Metric::Ensemble(EnsembleMetric::DiceAgreementInSamples),
            Metric::Ensemble(EnsembleMetric::SampleVariance),
        ]
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for Metric {
    type Error = ProbSegError;

    fn try_from(value: String) -> Result<Self> {
        Metric::all()
            .into_iter()
            .find(|m| m.name() == value.trim())
            .ok_or_else(|| ProbSegError::Config(format!("unknown metric '{value}'")))
    }
}

impl From<Metric> for String {
    fn from(metric: Metric) -> Self {
        metric.name().to_string()
    }
}

/// Per-class `(intersection, union, |a|, |b|)` counts between two label maps.
fn class_counts(a: &[u32], b: &[u32], num_classes: usize) -> Vec<(u64, u64, u64, u64)> {
    let mut counts = vec![(0u64, 0u64, 0u64, 0u64); num_classes];
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as usize, y as usize);
        if x < num_classes {
            counts[x].2 += 1;
        }
        if y < num_classes {
            counts[y].3 += 1;
        }
        if x == y && x < num_classes {
            counts[x].0 += 1;
        }
    }
    for c in &mut counts {
        c.1 = c.2 + c.3 - c.0;
    }
    counts
}

/// Mean IoU over classes present in either map; 1.0 if both are empty.
pub fn mean_iou(a: &[u32], b: &[u32], num_classes: usize) -> f64 {
    let scores: Vec<f64> = class_counts(a, b, num_classes)
        .into_iter()
        .filter(|c| c.1 > 0)
        .map(|(i, u, _, _)| i as f64 / u as f64)
        .collect();
    if scores.is_empty() {
        1.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// Mean dice over classes present in either map; 1.0 if both are empty.
pub fn mean_dice(a: &[u32], b: &[u32], num_classes: usize) -> f64 {
    let scores: Vec<f64> = class_counts(a, b, num_classes)
        .into_iter()
        .filter(|c| c.2 + c.3 > 0)
        .map(|(i, _, na, nb)| 2.0 * i as f64 / (na + nb) as f64)
        .collect();
    if scores.is_empty() {
        1.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

fn labels_vec(t: &Tensor) -> Result<Vec<u32>> {
    Ok(t.to_dtype(DType::U32)?.flatten_all()?.to_vec1()?)
}

impl SingleMetric {
    /// Score `output` `[B, C, H, W]` against labels `[B, H, W]`, averaged over
    /// the batch.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the shapes do not line up.
    pub fn compute(&self, output: &Tensor, target: &Tensor) -> Result<f64> {
        let (b, c, h, w) = output.dims4()?;
        if target.dims() != &[b, h, w] {
            return Err(ProbSegError::shape_mismatch(
                format!("target [{b}, {h}, {w}]"),
                format!("{:?}", target.dims()),
            ));
        }
        let pred = labels_vec(&output.argmax(1)?)?;
        let truth = labels_vec(target)?;
        let px = h * w;

        let mut total = 0.0;
        for i in 0..b {
            let p = &pred[i * px..(i + 1) * px];
            let t = &truth[i * px..(i + 1) * px];
            total += match self {
                SingleMetric::Dice => mean_dice(p, t, c),
                SingleMetric::Iou => mean_iou(p, t, c),
                SingleMetric::PixelAccuracy => {
                    p.iter().zip(t).filter(|(a, b)| a == b).count() as f64 / px as f64
                }
            };
        }
        Ok(total / b as f64)
    }
}

/// Mean of `f` over all `n^2` ordered pairs, diagonal included.
fn mean_over_all_pairs<F: Fn(&[u32], &[u32]) -> f64>(set: &[&[u32]], f: F) -> f64 {
    let mut total = 0.0;
    for &a in set {
        for &b in set {
            total += f(a, b);
        }
    }
    total / (set.len() * set.len()).max(1) as f64
}

/// The `count` maps of example `i` in a flat `[B, count, H, W]` buffer.
fn members(data: &[u32], i: usize, count: usize, px: usize) -> Vec<&[u32]> {
    (0..count)
        .map(|k| {
            let start = (i * count + k) * px;
            &data[start..start + px]
        })
        .collect()
}

/// Mean of `f` over ordered pairs of distinct members; 0 with fewer than two.
fn mean_over_pairs<F: Fn(&[u32], &[u32]) -> f64>(samples: &[&[u32]], f: F) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..n {
        for j in 0..n {
            if i != j {
                total += f(samples[i], samples[j]);
                pairs += 1;
            }
        }
    }
    total / pairs as f64
}

impl EnsembleMetric {
    /// Score `samples` `[B, N, H, W]` (labels) against `target`, averaged
    /// over the batch. `target` is `[B, H, W]` for one annotation per example
    /// or `[B, R, H, W]` for `R` raters.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the shapes do not line up.
    pub fn compute(&self, samples: &Tensor, target: &Tensor, num_classes: usize) -> Result<f64> {
        let (b, n, h, w) = samples.dims4()?;
        let raters = match target.dims() {
            [tb, th, tw] if (*tb, *th, *tw) == (b, h, w) => 1,
            [tb, r, th, tw] if *r > 0 && (*tb, *th, *tw) == (b, h, w) => *r,
            _ => {
                return Err(ProbSegError::shape_mismatch(
                    format!("target [{b}, {h}, {w}] or [{b}, R, {h}, {w}]"),
                    format!("{:?}", target.dims()),
                ))
            }
        };
        let all = labels_vec(samples)?;
        let truth = labels_vec(target)?;
        let px = h * w;
        let mut total = 0.0;
        for i in 0..b {
            let item = members(&all, i, n, px);

            total += match self {
                EnsembleMetric::Ged => {
                    let annotations = members(&truth, i, raters, px);
                    let d = |a: &[u32], b: &[u32]| 1.0 - mean_iou(a, b, num_classes);
                    let mut cross = 0.0;
                    for &s in &item {
                        for &y in &annotations {
                            cross += d(s, y);
                        }
                    }
                    cross /= (n * raters) as f64;
                    2.0 * cross
                        - mean_over_all_pairs(&item, d)
                        - mean_over_all_pairs(&annotations, d)
                }
                EnsembleMetric::IouSamplesPerLabel => {
                    if n < 2 {
                        1.0
                    } else {
                        mean_over_pairs(&item, |a, b| mean_iou(a, b, num_classes))
                    }
                }
                EnsembleMetric::DiceAgreementInSamples => {
                    if n < 2 {
                        1.0
                    } else {
                        mean_over_pairs(&item, |a, b| mean_dice(a, b, num_classes))
                    }
                }
                EnsembleMetric::SampleVariance => {
                    let mut acc = 0.0;
                    let mut freq = vec![0usize; num_classes.max(1)];
                    for p in 0..px {
                        freq.iter_mut().for_each(|f| *f = 0);
                        for s in &item {
                            if let Some(f) = freq.get_mut(s[p] as usize) {
                                *f += 1;
                            }
                        }
                        acc += freq
                            .iter()
                            .map(|&f| {
                                let q = f as f64 / n as f64;
                                q * (1.0 - q)
                            })
                            .sum::<f64>();
                    }
                    acc / px as f64
                }
            };
        }
        Ok(total / b as f64)
    }
}

/// Running averages keyed by metric name.
#[derive(Debug, Clone, Default)]
pub struct MetricTracker {
    totals: BTreeMap<String, (f64, usize)>,
}

impl MetricTracker {
    /// Tracker pre-populated with `keys` (so they appear even if never updated).
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            totals: keys.into_iter().map(|k| (k.into(), (0.0, 0))).collect(),
        }
    }

    /// Add `value` observed `n` times.
    pub fn update(&mut self, key: &str, value: f64, n: usize) {
        let entry = self.totals.entry(key.to_string()).or_insert((0.0, 0));
        entry.0 += value * n as f64;
        entry.1 += n;
    }

    /// Running average of `key`.
    pub fn avg(&self, key: &str) -> Option<f64> {
        self.totals
            .get(key)
            .filter(|(_, count)| *count > 0)
            .map(|(total, count)| total / *count as f64)
    }

    /// Averages of every key that received at least one update.
    pub fn result(&self) -> BTreeMap<String, f64> {
        self.totals
            .iter()
            .filter(|(_, (_, count))| *count > 0)
            .map(|(k, (total, count))| (k.clone(), total / *count as f64))
            .collect()
    }

    /// Zero every key.
    pub fn reset(&mut self) {
        self.totals.values_mut().for_each(|v| *v = (0.0, 0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn labels(data: &[u32], shape: &[usize]) -> Tensor {
        Tensor::from_slice(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_metric_names_roundtrip() {
        for metric in Metric::all() {
            assert_eq!(Metric::try_from(metric.name().to_string()).unwrap(), metric);
        }
        assert!(Metric::try_from("hausdorff".to_string()).is_err());
    }

    #[test]
    fn test_metric_kinds() {
        assert!(matches!(
            Metric::try_from("ged".to_string()).unwrap(),
            Metric::Ensemble(EnsembleMetric::Ged)
        ));
        assert!(matches!(
            Metric::try_from("dice".to_string()).unwrap(),
            Metric::Single(SingleMetric::Dice)
        ));
    }

    #[test]
    fn test_mean_iou_and_dice() {
        let a = [0, 0, 1, 1];
        let b = [0, 1, 1, 1];
        // class 0: 1/2, class 1: 2/3
        assert!((mean_iou(&a, &b, 2) - (0.5 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
        // class 0: 2/3, class 1: 4/5
        assert!((mean_dice(&a, &b, 2) - (2.0 / 3.0 + 0.8) / 2.0).abs() < 1e-12);
        assert_eq!(mean_iou(&a, &a, 2), 1.0);
    }

    #[test]
    fn test_single_metrics_on_scores() -> Result<()> {
        // argmax over 2 classes: [1, 0, 1, 1]
        let scores = Tensor::from_slice(
            &[0f32, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0],
            (1, 2, 2, 2),
            &Device::Cpu,
        )?;
        let target = labels(&[1, 0, 0, 1], &[1, 2, 2]);
        assert!((SingleMetric::PixelAccuracy.compute(&scores, &target)? - 0.75).abs() < 1e-12);
        let iou = SingleMetric::Iou.compute(&scores, &target)?;
        assert!((iou - (0.5 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_ensemble_identical_samples() -> Result<()> {
        let sample = [0u32, 1, 1, 0];
        let mut data = Vec::new();
        for _ in 0..3 {
            data.extend_from_slice(&sample);
        }
        let samples = labels(&data, &[1, 3, 2, 2]);
        let target = labels(&sample, &[1, 2, 2]);

        assert!(EnsembleMetric::Ged.compute(&samples, &target, 2)?.abs() < 1e-12);
        assert_eq!(EnsembleMetric::IouSamplesPerLabel.compute(&samples, &target, 2)?, 1.0);
        assert_eq!(EnsembleMetric::DiceAgreementInSamples.compute(&samples, &target, 2)?, 1.0);
        assert_eq!(EnsembleMetric::SampleVariance.compute(&samples, &target, 2)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_ensemble_diverse_samples() -> Result<()> {
        let samples = labels(&[0, 0, 1, 1], &[1, 2, 1, 2]);
        let target = labels(&[0, 0], &[1, 1, 2]);
        // sample variance: every pixel split 50/50 -> 2 * 0.25
        assert!((EnsembleMetric::SampleVariance.compute(&samples, &target, 2)? - 0.5).abs() < 1e-12);
        assert_eq!(EnsembleMetric::IouSamplesPerLabel.compute(&samples, &target, 2)?, 0.0);
        // cross (0 + 1) / 2, samples (0 + 1 + 1 + 0) / 4, one annotation 0
        assert!((EnsembleMetric::Ged.compute(&samples, &target, 2)? - 0.5).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_ged_against_every_rater() -> Result<()> {
        let samples = labels(&[0, 0, 1, 1], &[1, 2, 1, 2]);
        // raters disagree exactly like the samples do
        let raters = labels(&[0, 0, 1, 1], &[1, 2, 1, 2]);
        assert!(EnsembleMetric::Ged.compute(&samples, &raters, 2)?.abs() < 1e-12);

        // both samples agree with rater 0 only
        let agreeing = labels(&[0, 0, 0, 0], &[1, 2, 1, 2]);
        // cross (0 + 1 + 0 + 1) / 4, samples 0, raters (0 + 1 + 1 + 0) / 4
        let ged = EnsembleMetric::Ged.compute(&agreeing, &raters, 2)?;
        assert!((ged - 0.5).abs() < 1e-12);

        let single = labels(&[0, 0], &[1, 1, 2]);
        let one_rater = labels(&[0, 0], &[1, 1, 1, 2]);
        assert_eq!(
            EnsembleMetric::Ged.compute(&samples, &single, 2)?,
            EnsembleMetric::Ged.compute(&samples, &one_rater, 2)?
        );
        Ok(())
    }

    #[test]
    fn test_ensemble_target_shape_checked() {
        let samples = labels(&[0, 0, 1, 1], &[1, 2, 1, 2]);
        let wrong = labels(&[0, 0, 0], &[1, 1, 3]);
        assert!(matches!(
            EnsembleMetric::Ged.compute(&samples, &wrong, 2),
            Err(ProbSegError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_tracker_averages_and_reset() {
        let mut tracker = MetricTracker::new(["loss", "dice"]);
        tracker.update("loss", 1.0, 1);
        tracker.update("loss", 3.0, 1);
        assert_eq!(tracker.avg("loss"), Some(2.0));
        assert_eq!(tracker.avg("dice"), None);
        assert_eq!(tracker.result().len(), 1);

        tracker.reset();
        assert_eq!(tracker.avg("loss"), None);
    }
}
