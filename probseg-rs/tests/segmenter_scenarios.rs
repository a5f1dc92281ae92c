//! End-to-end scenarios for the probabilistic segmenter.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use probseg_rs::backbone::Backbone;
use probseg_rs::component::{Component, ParamScope};
use probseg_rs::config::{BackboneConfig, ModelConfig};
use probseg_rs::model::{
    ForwardMode, ImageInput, KlEstimate, PosteriorDraw, SampleMode, SegmenterSession,
    SessionState,
};
use probseg_rs::{ProbSegConfig, ProbSegError, ProbabilisticSegmenter, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

fn quicknat_model() -> ProbabilisticSegmenter {
    let model = ModelConfig {
        num_channels: 1,
        num_classes: 28,
        latent_dim: 6,
        filter_counts: vec![32, 64, 128, 192],
        ..Default::default()
    };
    let backbone = BackboneConfig {
        filters: vec![16, 32],
        convs_per_stage: 1,
    };
    ProbabilisticSegmenter::new(&model, &backbone, &Device::Cpu).unwrap()
}

fn tiny_model() -> ProbabilisticSegmenter {
    let config = ProbSegConfig::tiny_preset();
    ProbabilisticSegmenter::new(&config.model, &config.backbone, &Device::Cpu).unwrap()
}

#[test]
fn test_training_forward_then_sample_preserves_spatial_size() -> Result<()> {
    let model = quicknat_model();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    for (h, w) in [(16, 16), (13, 11)] {
        let image = Tensor::randn(0f32, 1.0, (1, 1, h, w), &Device::Cpu)?;
        let mask = Tensor::zeros((1, h, w), DType::U32, &Device::Cpu)?;

        let ctx = model.forward(&image, Some(&mask), ForwardMode::Training)?;
        let logits = model.sample(&ctx, SampleMode::Train, &mut rng)?;
        assert_eq!(logits.dims(), &[1, 28, h, w]);
        assert_eq!(ctx.prior().mean().dims(), &[1, 6]);
    }
    Ok(())
}

#[test]
fn test_sample_before_forward_is_precondition_error() {
    let mut session = SegmenterSession::new(tiny_model(), 3);
    let err = session.sample(true).unwrap_err();
    assert!(matches!(err, ProbSegError::Precondition(_)));
    assert!(err.to_string().contains("before forward"));
}

#[test]
fn test_session_full_cycle() -> Result<()> {
    let mut session = SegmenterSession::new(tiny_model(), 3);
    let image = Tensor::randn(0f32, 1.0, (2, 1, 9, 9), &Device::Cpu)?;
    let mask = Tensor::ones((2, 1, 9, 9), DType::F32, &Device::Cpu)?;

    let features = session.forward(&image, Some(&mask), true)?;
    assert_eq!(features.dims(), &[2, 3, 9, 9]);
    assert_eq!(session.state(), SessionState::Ready(ForwardMode::Training));

    let a = session.reconstruct(true, false, None)?;
    let b = session.reconstruct(true, false, None)?;
    assert_eq!(
        a.flatten_all()?.to_vec1::<f32>()?,
        b.flatten_all()?.to_vec1::<f32>()?
    );

    let kl = session.kl_divergence(true, false, None)?;
    assert_eq!(kl.dims(), &[2]);
    assert!(kl.to_vec1::<f32>()?.iter().all(|&v| v >= -1e-4));

    let z = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
    assert_eq!(session.reconstruct(false, false, Some(z.clone()))?.dims(), &[2, 3, 9, 9]);
    assert_eq!(session.kl_divergence(false, false, Some(z))?.dims(), &[2]);
    assert!(session.reconstruct(true, true, None).is_err());
    Ok(())
}

#[test]
fn test_test_mode_samples_differ_but_are_seeded() -> Result<()> {
    let model = tiny_model();
    let image = Tensor::randn(0f32, 1.0, (1, 1, 8, 8), &Device::Cpu)?;
    let ctx = model.forward(&image, None, ForwardMode::Inference)?;

    let draw = |seed| -> Result<Vec<f32>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Ok(model.draw_prior(&ctx, SampleMode::Test, &mut rng)?.into_tensor().flatten_all()?.to_vec1()?)
    };
    assert_eq!(draw(1)?, draw(1)?);
    assert_ne!(draw(1)?, draw(2)?);
    Ok(())
}

#[test]
fn test_monte_carlo_kl_at_supplied_latent() -> Result<()> {
    let model = tiny_model();
    let image = Tensor::randn(0f32, 1.0, (3, 1, 8, 8), &Device::Cpu)?;
    let mask = Tensor::zeros((3, 8, 8), DType::U8, &Device::Cpu)?;
    let ctx = model.forward(&image, Some(&mask), ForwardMode::Training)?;
    let mut rng = ChaCha8Rng::seed_from_u64(9);

    let z = ctx.posterior().unwrap().mean().clone();
    let mc = model.kl_divergence(&ctx, KlEstimate::MonteCarlo(PosteriorDraw::Supplied(z)), &mut rng)?;
    let at_mean = model.kl_divergence(&ctx, KlEstimate::MonteCarlo(PosteriorDraw::Mean), &mut rng)?;
    assert_eq!(mc.to_vec1::<f32>()?, at_mean.to_vec1::<f32>()?);
    Ok(())
}

#[test]
fn test_predict_after_save_and_load() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("nested").join("model.safetensors");
    let model = tiny_model();
    model.save(&path)?;
    let loaded = ProbabilisticSegmenter::load(&path, &Device::Cpu)?;

    let data: Vec<f32> = (0..64).map(|i| i as f32 / 64.0).collect();
    let input = ImageInput::Array {
        data: &data,
        shape: &[8, 8],
    };
    let a = model.predict(input, &mut ChaCha8Rng::seed_from_u64(5))?;
    let input = ImageInput::Array {
        data: &data,
        shape: &[1, 8, 8],
    };
    let b = loaded.predict(input, &mut ChaCha8Rng::seed_from_u64(5))?;
    assert_eq!(a.dims(), &[8, 8]);
    assert_eq!(
        a.flatten_all()?.to_vec1::<u32>()?,
        b.flatten_all()?.to_vec1::<u32>()?
    );
    Ok(())
}

struct OneConv {
    conv: Conv2d,
    out: usize,
    scope: ParamScope,
}

impl Component for OneConv {
    fn scope(&self) -> &ParamScope {
        &self.scope
    }
}

impl Backbone for OneConv {
    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        Ok(self.conv.forward(image)?)
    }

    fn out_channels(&self) -> usize {
        self.out
    }
}

fn one_conv(out: usize) -> impl FnOnce(VarBuilder, ParamScope) -> Result<Box<dyn Backbone>> {
    move |vb, scope| {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv2d(1, out, 3, cfg, vb.pp("conv"))?;
        Ok(Box::new(OneConv { conv, out, scope }) as Box<dyn Backbone>)
    }
}

#[test]
fn test_custom_backbone() -> Result<()> {
    let config = ProbSegConfig::tiny_preset().model;
    let model = ProbabilisticSegmenter::with_backbone(&config, &Device::Cpu, one_conv(3))?;
    let image = Tensor::randn(0f32, 1.0, (1, 1, 6, 6), &Device::Cpu)?;
    let ctx = model.forward(&image, None, ForwardMode::Inference)?;
    let logits = model.sample(&ctx, SampleMode::Test, &mut ChaCha8Rng::seed_from_u64(0))?;
    assert_eq!(logits.dims(), &[1, 3, 6, 6]);

    let dir = TempDir::new()?;
    assert!(matches!(
        model.save(dir.path().join("custom.safetensors")),
        Err(ProbSegError::Checkpoint(_))
    ));
    Ok(())
}

#[test]
fn test_backbone_channel_count_checked() {
    let config = ProbSegConfig::tiny_preset().model;
    let result = ProbabilisticSegmenter::with_backbone(&config, &Device::Cpu, one_conv(5));
    assert!(matches!(result, Err(ProbSegError::ShapeMismatch { .. })));
}
