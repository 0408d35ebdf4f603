//! Performance benchmarks for compiled graph execution
//!
//! Benchmarks:
//! - Training step of a two-layer classifier across batch sizes
//! - Fused versus unfused softmax/cross-entropy
//! - Graph compilation

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use strata_ad::prelude::*;
use strata_core::shape;

const FEATURES: usize = 64;
const HIDDEN: usize = 32;
const CLASSES: usize = 10;
const SAMPLES: usize = 256;

fn build(batch: usize) -> (GraphBuilder, NodeId) {
    let data: Vec<f32> = (0..SAMPLES * FEATURES)
        .map(|i| ((i * 37) % 101) as f32 / 101.0 - 0.5)
        .collect();
    let labels: Vec<usize> = (0..SAMPLES).map(|i| (i * 7) % CLASSES).collect();

    let mut g = GraphBuilder::new();
    let x = g
        .input(Box::new(InMemorySource::new(FEATURES, data).unwrap()), batch)
        .unwrap();
    let t = g
        .input(Box::new(InMemorySource::one_hot(&labels, CLASSES).unwrap()), batch)
        .unwrap();
    let w1 = g
        .variable(
            shape![HIDDEN, FEATURES],
            Initializer::XavierUniform { seed: 1 },
            Adam::new(OptimizerConfig::adam()),
        )
        .unwrap();
    let b1 = g
        .variable(shape![HIDDEN], Initializer::Zeros, Adam::new(OptimizerConfig::adam()))
        .unwrap();
    let w2 = g
        .variable(
            shape![CLASSES, HIDDEN],
            Initializer::XavierUniform { seed: 2 },
            Adam::new(OptimizerConfig::adam()),
        )
        .unwrap();

    let z = g.matmul(w1, x).unwrap();
    let bias = g.broadcast(b1, BroadcastAxis::Columns, HIDDEN, batch).unwrap();
    let z = g.add(z, bias).unwrap();
    let h = g.activation(z, Activation::ReLU).unwrap();
    let logits = g.matmul(w2, h).unwrap();
    let p = g.softmax(logits, SoftmaxAxis::Columns).unwrap();
    let loss = g.cross_entropy(p, t).unwrap();
    (g, loss)
}

fn session(batch: usize, config: CompilerConfig) -> Session {
    let (g, loss) = build(batch);
    let graph = GraphCompiler::new(config).compile(g, loss).unwrap();
    Session::new(graph, SessionConfig::default().learning_rate(1e-3)).unwrap()
}

/// Benchmark one training step across batch sizes
fn bench_train_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("train_step");

    for batch in [1, 16, 64].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |bencher, &batch| {
            let mut session = session(batch, CompilerConfig::default());
            let batches = session.batch_count();
            let mut index = 0;
            bencher.iter(|| {
                session.train_step(black_box(index)).unwrap();
                index = (index + 1) % batches;
            });
        });
    }
    group.finish();
}

/// Benchmark gradient computation with and without fusion
fn bench_fusion(c: &mut Criterion) {
    let mut group = c.benchmark_group("softmax_cross_entropy");

    let configs = [
        ("fused", CompilerConfig::default()),
        ("unfused", CompilerConfig::unfused()),
    ];
    for (name, config) in configs {
        group.bench_function(name, |bencher| {
            let mut session = session(64, config.clone());
            bencher.iter(|| session.compute_gradients(black_box(0)).unwrap());
        });
    }
    group.finish();
}

/// Benchmark graph compilation (fusion, layering and arena sizing)
fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile", |bencher| {
        bencher.iter_batched(
            || build(64),
            |(g, loss)| black_box(GraphCompiler::default().compile(g, loss).unwrap()),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_train_step, bench_fusion, bench_compile);
criterion_main!(benches);
