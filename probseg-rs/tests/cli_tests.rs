//! Integration tests for the probseg CLI.

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Helper function to create a test configuration file.
fn create_test_config(path: &Path, content: &str) -> PathBuf {
    let config_path = path.join("config.yaml");
    fs::write(&config_path, content).expect("Failed to write test config");
    config_path
}

/// Helper function to run the probseg CLI with given arguments.
fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("probseg").expect("Failed to find probseg binary");
    cmd.args(args);
    cmd
}

/// Small network on synthetic data, writing into `output_dir`.
fn tiny_config_yaml(output_dir: &Path) -> String {
    format!(
        r#"
model:
  num_channels: 1
  num_classes: 3
  latent_dim: 2
  filter_counts: [3, 8, 16]
  convs_per_block: 1
  convs_per_fcomb_block: 3
backbone:
  filters: [8, 16]
  convs_per_stage: 1
training:
  epochs: 1
  batch_size: 2
  learning_rate: 0.001
  metrics_sample_count: 2
  save_period: 1
  metrics: [dice, ged, sample_variance]
dataset:
  synthetic:
    num_samples: 4
    num_valid: 2
    height: 8
    width: 8
visualization:
  max_examples: 2
output_dir: "{}"
device: cpu
"#,
        output_dir.display()
    )
}

/// Configuration rejected by `validate()`.
fn invalid_config_yaml() -> &'static str {
    r#"
model:
  num_classes: 4
  convs_per_fcomb_block: 1
"#
}

#[test]
fn test_validate_command_valid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), &tiny_config_yaml(temp_dir.path()));

    let mut cmd = run_cli(&["validate", config_path.to_str().unwrap()]);

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("Configuration is valid"))
        .stdout(predicates::str::contains("3 classes"))
        .stdout(predicates::str::contains("synthetic"));
}

#[test]
fn test_validate_command_invalid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), invalid_config_yaml());

    let mut cmd = run_cli(&["validate", config_path.to_str().unwrap()]);

    cmd.assert().failure();
}

#[test]
fn test_validate_command_unknown_metric() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), "training:\n  metrics: [hausdorff]\n");

    let mut cmd = run_cli(&["validate", config_path.to_str().unwrap()]);

    cmd.assert().failure();
}

#[test]
fn test_validate_command_missing_file() {
    let mut cmd = run_cli(&["validate", "/nonexistent/config.yaml"]);

    cmd.assert().failure();
}

#[test]
fn test_train_command_help() {
    let mut cmd = run_cli(&["train", "--help"]);

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("Start training"))
        .stdout(predicates::str::contains("CONFIG"))
        .stdout(predicates::str::contains("--resume"));
}

#[test]
fn test_predict_command_help() {
    let mut cmd = run_cli(&["predict", "--help"]);

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("--model"))
        .stdout(predicates::str::contains("--image"))
        .stdout(predicates::str::contains("--output"));
}

#[test]
fn test_init_command_creates_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("test_config.yaml");

    let mut cmd = run_cli(&["init", output_path.to_str().unwrap(), "--preset", "lidc"]);

    cmd.assert().success();

    assert!(output_path.exists(), "Config file should be created");
    let content = fs::read_to_string(&output_path).expect("Failed to read generated config");
    assert!(content.contains("num_classes: 2"));
    assert!(content.contains("metrics_sample_count"));
}

#[test]
fn test_init_command_unknown_preset() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("test_config.yaml");

    let mut cmd = run_cli(&["init", output_path.to_str().unwrap(), "--preset", "unet"]);

    cmd.assert().failure();
    assert!(!output_path.exists());
}

#[test]
fn test_train_then_predict() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let run_dir = temp_dir.path().join("run");
    let config_path = create_test_config(temp_dir.path(), &tiny_config_yaml(&run_dir));

    run_cli(&["train", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("Training finished after epoch 1"))
        .stdout(predicates::str::contains("val_ged"));

    let model_path = run_dir.join("model_best.safetensors");
    assert!(model_path.exists());
    assert!(run_dir.join("checkpoint-epoch1.safetensors").exists());
    assert!(run_dir.join("segmentations_epoch1.png").exists());

    let image_path = temp_dir.path().join("scan.png");
    image::GrayImage::from_fn(10, 7, |x, y| image::Luma([((x + y) * 10) as u8]))
        .save(&image_path)
        .expect("Failed to write test image");
    let output_path = temp_dir.path().join("labels.png");

    run_cli(&[
        "predict",
        "--model",
        model_path.to_str().unwrap(),
        "--image",
        image_path.to_str().unwrap(),
        "--output",
        output_path.to_str().unwrap(),
    ])
    .assert()
    .success()
    .stdout(predicates::str::contains("Segmentation written"));

    let labels = image::open(&output_path).expect("Failed to read prediction");
    assert_eq!((labels.width(), labels.height()), (10, 7));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("probseg").expect("Failed to find probseg binary");
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("probseg"));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("probseg").expect("Failed to find probseg binary");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("Probabilistic segmentation"))
        .stdout(predicates::str::contains("validate"))
        .stdout(predicates::str::contains("train"))
        .stdout(predicates::str::contains("predict"))
        .stdout(predicates::str::contains("init"));
}
