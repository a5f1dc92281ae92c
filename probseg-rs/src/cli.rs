//! Command-line interface.

use std::path::PathBuf;

use candle_core::Tensor;
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{DeviceSpec, ProbSegConfig};
use crate::error::Result;
use crate::model::{ImageInput, ProbabilisticSegmenter};
use crate::trainer::SamplingTrainer;
use crate::visualization::colorize_labels;

/// Top-level arguments.
#[derive(Debug, Parser)]
#[command(name = "probseg")]
#[command(about = "Probabilistic segmentation with sampled latent uncertainty")]
#[command(version)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (quicknat-28, lidc, tiny)
        #[arg(long, default_value = "quicknat-28")]
        preset: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from checkpoint
        #[arg(long)]
        resume: Option<String>,
    },
    /// Segment a greyscale PNG with a saved model
    Predict {
        /// Saved model (.safetensors)
        #[arg(long)]
        model: String,
        /// Input image
        #[arg(long)]
        image: String,
        /// Output PNG with coloured labels
        #[arg(long)]
        output: String,
        /// Seed for the latent draw
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Device (auto, cpu, cuda:N)
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

/// Execute a parsed command line.
///
/// # Errors
///
/// Returns any configuration, training or I/O error of the command.
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = ProbSegConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  Model: {} classes, latent dim {}, filters {:?}",
                config.model.num_classes,
                config.model.latent_dim,
                config.model.effective_filter_counts()
            );
            println!(
                "  Training: {} epochs, {:?} objective, {} validation samples",
                config.training.epochs,
                config.training.objective,
                config.training.metrics_sample_count
            );
            match &config.dataset.train_path {
                Some(path) => println!("  Dataset: {path}"),
                None => println!("  Dataset: synthetic"),
            }
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = ProbSegConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Train { config, resume } => {
            tracing::info!("Starting training with config: {}", config);
            let config = ProbSegConfig::from_file(&config)?;
            let mut trainer = SamplingTrainer::new(config)?;
            if let Some(checkpoint) = resume {
                trainer.resume_from(&PathBuf::from(checkpoint))?;
            }
            let logs = trainer.train()?;
            if let Some(last) = logs.last() {
                println!("✓ Training finished after epoch {}", last.epoch);
                for (key, value) in &last.metrics {
                    println!("  {key}: {value:.6}");
                }
            }
        }
        Commands::Predict {
            model,
            image,
            output,
            seed,
            device,
        } => {
            let device = DeviceSpec::try_from(device)?.resolve()?;
            let mut model = ProbabilisticSegmenter::load(&model, &device)?;
            model.set_training(false);

            let grey = image::open(&image)?.to_luma32f();
            let (w, h) = grey.dimensions();
            let pixels = Tensor::from_vec(grey.into_raw(), (h as usize, w as usize), &device)?;
            let channels = model.config().num_channels;
            let input = if channels == 1 {
                pixels
            } else {
                pixels.unsqueeze(0)?.repeat((channels, 1, 1))?
            };

            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let labels = model.predict(ImageInput::Tensor(&input), &mut rng)?;
            colorize_labels(&labels)?.save(&output)?;
            println!("✓ Segmentation written to: {output}");
        }
    }

    Ok(())
}
