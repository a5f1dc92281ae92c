//! # probseg-rs
//!
//! Probabilistic segmentation in the style of a conditional VAE.
//!
//! A deterministic backbone produces a feature map, a prior network maps the
//! image to a diagonal Gaussian over a low-dimensional latent space, and a
//! feature combiner fuses one latent draw with the feature map into class
//! logits. Drawing several latents for the same image yields an ensemble of
//! plausible segmentations whose disagreement measures uncertainty.
//!
//! ## Features
//!
//! - **Prior / posterior heads** - axis-aligned Gaussians from conv encoders
//! - **Sampling trainer** - single-sample training, N-sample validation
//! - **Uncertainty metrics** - GED, pairwise IoU/dice, per-pixel variance
//! - **YAML Configuration** - presets plus `validate()`
//! - **Single-file artifacts** - safetensors with the architecture in metadata
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a config and check it
//! probseg init config.yaml --preset tiny
//! probseg validate config.yaml
//!
//! # Train (synthetic data when no dataset path is set)
//! probseg train config.yaml
//!
//! # Segment an image
//! probseg predict --model outputs/tiny/model_best.safetensors --image scan.png --output labels.png
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use probseg_rs::{ProbSegConfig, SamplingTrainer};
//!
//! # fn main() -> probseg_rs::Result<()> {
//! let config = ProbSegConfig::from_file("config.yaml")?;
//! let mut trainer = SamplingTrainer::new(config)?;
//! trainer.train()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sampling an ensemble
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use probseg_rs::trainer::sample_ensemble;
//! use probseg_rs::{ProbSegConfig, ProbabilisticSegmenter};
//! use rand::SeedableRng;
//!
//! # fn main() -> probseg_rs::Result<()> {
//! let config = ProbSegConfig::from_preset("tiny")?;
//! let model = ProbabilisticSegmenter::new(&config.model, &config.backbone, &Device::Cpu)?;
//! let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
//!
//! let images = Tensor::randn(0f32, 1.0, (2, 1, 12, 12), &Device::Cpu)?;
//! let ensemble = sample_ensemble(&model, &images, 4, &mut rng)?;
//! assert_eq!(ensemble.samples().dims(), &[2, 4, 3, 12, 12]);
//! assert_eq!(ensemble.labels()?.dims(), &[2, 4, 12, 12]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod backbone;
pub mod cli;
pub mod component;
pub mod config;
pub mod dataset;
pub mod encoder;
pub mod error;
pub mod fcomb;
pub mod gaussian;
pub mod init;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;
pub mod visualization;

pub use config::{ProbSegConfig, TrainingConfig};
pub use error::{ProbSegError, Result};
pub use model::ProbabilisticSegmenter;
pub use trainer::SamplingTrainer;
