use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use embedding::positional::{RopeScalingConfig, RotaryConfig, RotaryEncoder};

fn rope_apply(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("rope_apply");

    let variants = [
        ("default", None),
        (
            "yarn",
            Some(RopeScalingConfig {
                kind: Some("yarn".into()),
                factor: Some(4.0),
                ..Default::default()
            }),
        ),
    ];

    for (name, scaling) in variants {
        let rope = RotaryEncoder::new(&RotaryConfig {
            dims: 128,
            max_position_embeddings: 32_768,
            scaling,
            ..Default::default()
        })
        .expect("valid rope config");

        for &seq_len in &[1usize, 256, 1024] {
            let x = Tensor::randn(0f32, 1.0, (1, 8, seq_len, 128), &device)
                .expect("input")
                .to_dtype(DType::F32)
                .expect("cast input");
            group.throughput(Throughput::Elements((8 * seq_len * 128) as u64));
            group.bench_with_input(BenchmarkId::new(name, seq_len), &x, |b, x| {
                b.iter(|| rope.apply(black_box(x), 512).expect("rope apply"))
            });
        }
    }
    group.finish();
}

criterion_group!(benches, rope_apply);
criterion_main!(benches);
