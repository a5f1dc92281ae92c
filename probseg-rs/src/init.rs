//! Seeded parameter initialization.
//!
//! Layers are created through a [`VarBuilder`](candle_nn::VarBuilder) first and
//! then re-initialized in place by walking the variable map under a name prefix.
//! Keys are visited in sorted order so a given seed always produces the same
//! parameters.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::config::WeightInit;
use crate::error::{ProbSegError, Result};

/// Standard deviation of the truncated-normal bias initializer.
pub const BIAS_STD: f32 = 1e-3;

/// Bias initialization for a convolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BiasInit {
    /// Normal with the given std, resampled outside two standard deviations.
    TruncatedNormal(f32),
    /// Unit normal.
    StandardNormal,
}

/// Seeded initializer for convolution weights and biases.
pub struct ParamInitializer {
    rng: ChaCha8Rng,
}

impl ParamInitializer {
    /// Create an initializer from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// He-normal values for a `[out, in, kh, kw]` kernel (fan-in, ReLU gain).
    pub fn he_normal(&mut self, shape: &[usize]) -> Vec<f32> {
        let fan_in: usize = shape.iter().skip(1).product::<usize>().max(1);
        let std = (2.0 / fan_in as f64).sqrt() as f32;
        let n: usize = shape.iter().product();
        self.normal(n, std)
    }

    /// `n` values from `N(0, std^2)`.
    pub fn normal(&mut self, n: usize, std: f32) -> Vec<f32> {
        (0..n)
            .map(|_| {
                let x: f32 = StandardNormal.sample(&mut self.rng);
                x * std
            })
            .collect()
    }

    /// `n` values from `N(0, std^2)` truncated to `[-2 std, 2 std]`.
    pub fn truncated_normal(&mut self, n: usize, std: f32) -> Vec<f32> {
        (0..n)
            .map(|_| loop {
                let x: f32 = StandardNormal.sample(&mut self.rng);
                if x.abs() <= 2.0 {
                    break x * std;
                }
            })
            .collect()
    }

    /// Row-major `[rows, cols]` matrix with orthonormal rows (if `rows <= cols`)
    /// or orthonormal columns (otherwise).
    ///
    /// Modified Gram-Schmidt over the columns of a Gaussian matrix of shape
    /// `[max, min]`, transposed back when the requested matrix is wide.
    pub fn orthogonal(&mut self, rows: usize, cols: usize) -> Vec<f32> {
        let long = rows.max(cols);
        let short = rows.min(cols);

        let mut basis: Vec<Vec<f64>> = (0..short)
            .map(|_| {
                (0..long)
                    .map(|_| self.rng.sample::<f64, _>(StandardNormal))
                    .collect()
            })
            .collect();

        for j in 0..short {
            let (done, rest) = basis.split_at_mut(j);
            let v = &mut rest[0];
            for q in done.iter() {
                let proj: f64 = q.iter().zip(v.iter()).map(|(a, b)| a * b).sum();
                v.iter_mut().zip(q.iter()).for_each(|(x, qi)| *x -= proj * qi);
            }
            let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt().max(1e-12);
            v.iter_mut().for_each(|x| *x /= norm);
        }

        let mut out = vec![0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[r * cols + c] = if rows >= cols {
                    basis[c][r] as f32
                } else {
                    basis[r][c] as f32
                };
            }
        }
        out
    }

    fn weight_values(&mut self, policy: WeightInit, shape: &[usize]) -> Vec<f32> {
        match policy {
            WeightInit::Default => self.he_normal(shape),
            WeightInit::Orthogonal => {
                let rows = shape.first().copied().unwrap_or(1);
                let cols = shape.iter().skip(1).product::<usize>().max(1);
                self.orthogonal(rows, cols)
            }
        }
    }

    fn bias_values(&mut self, policy: BiasInit, n: usize) -> Vec<f32> {
        match policy {
            BiasInit::TruncatedNormal(std) => self.truncated_normal(n, std),
            BiasInit::StandardNormal => self.normal(n, 1.0),
        }
    }

    /// Re-initialize every convolution under `prefix`.
    ///
    /// A convolution is a rank-4 `<stem>.weight`; its `<stem>.bias`, when
    /// present, is re-initialized with `bias`. Other variables under the
    /// prefix (batch-norm affine and running statistics) are left alone.
    /// Returns the number of convolutions touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable map lock is poisoned or a tensor
    /// cannot be written.
    pub fn init_convs(
        &mut self,
        varmap: &VarMap,
        prefix: &str,
        weight: WeightInit,
        bias: BiasInit,
    ) -> Result<usize> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| ProbSegError::Training("variable map lock poisoned".into()))?;

        let scope = format!("{prefix}.");
        let mut stems: Vec<&str> = data
            .iter()
            .filter(|(name, var)| name.starts_with(&scope) && var.rank() == 4)
            .filter_map(|(name, _)| name.strip_suffix(".weight"))
            .collect();
        stems.sort_unstable();

        for stem in &stems {
            if let Some(var) = data.get(&format!("{stem}.weight")) {
                let values = self.weight_values(weight, var.dims());
                overwrite(var, values)?;
            }
            if let Some(var) = data.get(&format!("{stem}.bias")) {
                let values = self.bias_values(bias, var.elem_count());
                overwrite(var, values)?;
            }
        }
        Ok(stems.len())
    }
}

fn overwrite(var: &Var, values: Vec<f32>) -> Result<()> {
    let tensor = Tensor::from_vec(values, var.shape(), var.device())?.to_dtype(var.dtype())?;
    var.set(&tensor)?;
    Ok(())
}
