//! AdamW optimizer wrapper over the model's variable map.

use candle_core::Tensor;
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::config::TrainingConfig;
use crate::error::{ProbSegError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1e-8,
        }
    }
}

impl From<&TrainingConfig> for OptimizerConfig {
    fn from(training: &TrainingConfig) -> Self {
        Self {
            learning_rate: training.learning_rate,
            weight_decay: training.weight_decay,
            ..Default::default()
        }
    }
}

impl OptimizerConfig {
    /// Create an AdamW optimizer over every variable in `varmap`.
    ///
    /// Variables that receive no gradient (batch-norm running statistics)
    /// are left untouched by the update.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build_adamw(&self, varmap: &VarMap) -> Result<AdamWOptimizer> {
        let vars = varmap.all_vars();
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        };

        let opt = candle_nn::AdamW::new(vars, params)
            .map_err(|e| ProbSegError::Training(format!("Failed to create AdamW: {e}")))?;

        Ok(AdamWOptimizer { inner: opt })
    }
}

/// AdamW optimizer wrapper.
pub struct AdamWOptimizer {
    inner: candle_nn::AdamW,
}

impl AdamWOptimizer {
    /// Backpropagate `loss` and apply one parameter update.
    ///
    /// Gradients are recomputed from scratch on every call, so there is no
    /// separate zeroing step.
    ///
    /// # Errors
    ///
    /// Returns an error if the backward pass or the update fails.
    pub fn step(&mut self, loss: &Tensor) -> Result<()> {
        self.inner
            .backward_step(loss)
            .map_err(|e| ProbSegError::Training(format!("Optimizer step failed: {e}")))
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}
