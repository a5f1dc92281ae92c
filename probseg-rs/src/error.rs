//! Error types for probseg-rs.
//!
//! This module provides the error enum and result alias for the library.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use probseg_rs::{ProbSegConfig, ProbSegError};
//!
//! # fn main() {
//! match ProbSegConfig::from_preset("invalid-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(ProbSegError::Config(msg)) => {
//!         eprintln!("Configuration error: {}", msg);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```
//!
//! # Example - Using Result Type
//!
//! ```no_run
//! use probseg_rs::{ProbSegConfig, SamplingTrainer, Result};
//!
//! fn train_model() -> Result<()> {
//!     let config = ProbSegConfig::from_file("config.yaml")?;
//!     let mut trainer = SamplingTrainer::new(config)?;
//!     trainer.train()?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias for probseg-rs operations.
pub type Result<T> = std::result::Result<T, ProbSegError>;

/// Errors that can occur in probseg-rs.
///
/// `Precondition` covers caller contract violations (sampling before a forward
/// pass, training forward without a mask, ambiguous reconstruction flags).
/// `ShapeMismatch` and `Candle` cover tensor shape problems, and
/// `NumericDegeneracy` flags invalid distribution parameters. None of them are
/// retried inside the crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProbSegError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A required earlier step was not performed, or arguments were contradictory.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Shape mismatch detected before reaching a tensor kernel.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Expected shape description
        expected: String,
        /// Actual shape description
        got: String,
    },

    /// Non-finite or otherwise invalid numeric state.
    #[error("numeric degeneracy: {0}")]
    NumericDegeneracy(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Visualization error.
    #[error("visualization error: {0}")]
    Visualization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Safetensors container error.
    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// Image encoding/decoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl ProbSegError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}

impl From<indicatif::style::TemplateError> for ProbSegError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        ProbSegError::Template(err.to_string())
    }
}
