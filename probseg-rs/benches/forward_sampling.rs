use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use probseg_rs::model::{ForwardMode, SampleMode};
use probseg_rs::trainer::sample_ensemble;
use probseg_rs::{ProbSegConfig, ProbabilisticSegmenter};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn tiny_model() -> ProbabilisticSegmenter {
    let config = ProbSegConfig::tiny_preset();
    ProbabilisticSegmenter::new(&config.model, &config.backbone, &Device::Cpu).unwrap()
}

fn bench_forward_and_sample(c: &mut Criterion) {
    let model = tiny_model();
    let mut group = c.benchmark_group("forward_sample");
    for size in [16usize, 32, 64] {
        let image = Tensor::randn(0f32, 1.0, (2, 1, size, size), &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        group.bench_with_input(BenchmarkId::from_parameter(size), &image, |b, image| {
            b.iter(|| {
                let ctx = model.forward(image, None, ForwardMode::Inference).unwrap();
                black_box(model.sample(&ctx, SampleMode::Test, &mut rng).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_training_forward(c: &mut Criterion) {
    let model = tiny_model();
    let image = Tensor::randn(0f32, 1.0, (2, 1, 32, 32), &Device::Cpu).unwrap();
    let mask = Tensor::zeros((2, 32, 32), candle_core::DType::U32, &Device::Cpu).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    c.bench_function("training_forward_sample_32", |b| {
        b.iter(|| {
            let ctx = model
                .forward(&image, Some(&mask), ForwardMode::Training)
                .unwrap();
            black_box(model.sample(&ctx, SampleMode::Train, &mut rng).unwrap());
        });
    });
}

fn bench_sample_ensemble(c: &mut Criterion) {
    let model = tiny_model();
    let image = Tensor::randn(0f32, 1.0, (2, 1, 32, 32), &Device::Cpu).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let mut group = c.benchmark_group("sample_ensemble");
    for n in [1usize, 5, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| black_box(sample_ensemble(&model, &image, n, &mut rng).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_forward_and_sample,
    bench_training_forward,
    bench_sample_ensemble,
);
criterion_main!(benches);
