//! Learning rate schedulers, stepped once per epoch.

use crate::config::LrScheduler;
use crate::optimizer::AdamWOptimizer;

/// Learning rate scheduler types.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Linear decay to zero
    Linear {
        /// Total number of scheduler steps
        total_steps: usize,
    },
    /// Cosine annealing to zero
    Cosine {
        /// Total number of scheduler steps
        total_steps: usize,
    },
    /// Step decay
    Step {
        /// Steps between decays
        step_size: usize,
        /// Multiplicative factor per decay
        gamma: f64,
    },
}

impl SchedulerType {
    /// Build from the configured scheduler and the number of epochs.
    pub fn from_config(config: &LrScheduler, epochs: usize) -> Self {
        match config {
            LrScheduler::Constant => SchedulerType::Constant,
            LrScheduler::Linear => SchedulerType::Linear {
                total_steps: epochs,
            },
            LrScheduler::Cosine => SchedulerType::Cosine {
                total_steps: epochs,
            },
            LrScheduler::Step { step_size, gamma } => SchedulerType::Step {
                step_size: *step_size,
                gamma: *gamma,
            },
        }
    }
}

/// Learning rate scheduler.
pub struct LRScheduler {
    scheduler_type: SchedulerType,
    base_lr: f64,
    current_step: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_step: 0,
        }
    }

    /// Get learning rate for current step.
    pub fn get_lr(&self) -> f64 {
        match &self.scheduler_type {
            SchedulerType::Constant => self.base_lr,
            SchedulerType::Linear { total_steps } => {
                self.base_lr * (1.0 - self.progress(*total_steps)).max(0.0)
            }
            SchedulerType::Cosine { total_steps } => {
                let progress = self.progress(*total_steps);
                self.base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
            }
            SchedulerType::Step { step_size, gamma } => {
                let decays = self.current_step / (*step_size).max(1);
                self.base_lr * gamma.powi(i32::try_from(decays).unwrap_or(i32::MAX))
            }
        }
    }

    /// Number of steps taken so far.
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut AdamWOptimizer) {
        self.current_step += 1;
        let lr = self.get_lr();
        optimizer.set_learning_rate(lr);
    }

    fn progress(&self, total_steps: usize) -> f64 {
        if total_steps == 0 {
            return 1.0;
        }
        (self.current_step as f64 / total_steps as f64).min(1.0)
    }
}
