use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{
    dtypes::PrecisionPolicy,
    linear::LinearInit,
    mlp::FeedForwardLayer,
    moe::{MoeConfig, SparseMoeBlock},
};

fn bench_moe(c: &mut Criterion) {
    let device = Device::Cpu;
    let config = MoeConfig::new(256, 512, 8, 2);
    let block = SparseMoeBlock::with_init(&config, &LinearInit::XavierNormal, &device, DType::F32)
        .expect("moe init");
    let policy = PrecisionPolicy::default();

    let mut group = c.benchmark_group("moe");
    // Only the 256-token batch takes the sorted path.
    for &tokens in &[1usize, 16, 32, 256] {
        let input = Tensor::randn(0f32, 1.0, (1, tokens, config.hidden_size), &device).expect("input");
        group.throughput(Throughput::Elements((tokens * config.top_k) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tokens), &input, |b, input| {
            b.iter(|| {
                let out = block.forward(black_box(input), &policy).expect("forward");
                black_box(out);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_moe);
criterion_main!(benches);
