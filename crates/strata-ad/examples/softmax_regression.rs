//! Softmax regression on a synthetic three-class problem
//!
//! Builds `softmax(W x + b)` against one-hot labels, lets the compiler fuse
//! the softmax into the cross-entropy, and trains with Adam while an epoch
//! listener reports the loss.
//!
//! Run with `cargo run --example softmax_regression --features subscriber`
//! to see the compiler and session logs.

use anyhow::Result;
use strata_ad::gradcheck::{check_variable_gradient, GradCheckConfig};
use strata_ad::logging::{init_tracing, TracingConfig};
use strata_ad::prelude::*;
use strata_core::shape;

const CLASSES: usize = 3;
const SAMPLES_PER_CLASS: usize = 40;
const BATCH: usize = 16;

/// Points scattered around three centres
fn dataset() -> (Vec<f32>, Vec<usize>) {
    let centres = [(2.0f32, 0.0f32), (-1.0, 1.7), (-1.0, -1.7)];
    let mut features = Vec::new();
    let mut labels = Vec::new();
    for i in 0..SAMPLES_PER_CLASS {
        for (label, &(cx, cy)) in centres.iter().enumerate() {
            let angle = i as f32 * 2.4;
            let radius = 0.6 * ((i * 7 + label * 3) % 10) as f32 / 10.0;
            features.push(cx + radius * angle.cos());
            features.push(cy + radius * angle.sin());
            labels.push(label);
        }
    }
    (features, labels)
}

fn main() -> Result<()> {
    init_tracing(TracingConfig::default())?;
    println!("=== Softmax Regression ===\n");

    let (features, labels) = dataset();
    let mut g = GraphBuilder::new();
    let x = g.input(Box::new(InMemorySource::new(2, features)?), BATCH)?;
    let t = g.input(Box::new(InMemorySource::one_hot(&labels, CLASSES)?), BATCH)?;
    let w = g.variable(
        shape![CLASSES, 2],
        Initializer::XavierUniform { seed: 42 },
        Adam::new(OptimizerConfig::adam()),
    )?;
    let b = g.variable(shape![CLASSES], Initializer::Zeros, Adam::new(OptimizerConfig::adam()))?;

    let z = g.matmul(w, x)?;
    let bias = g.broadcast(b, BroadcastAxis::Columns, CLASSES, BATCH)?;
    let logits = g.add(z, bias)?;
    let p = g.softmax(logits, SoftmaxAxis::Columns)?;
    let loss = g.cross_entropy(p, t)?;

    let graph = GraphCompiler::default().compile(g, loss)?;
    println!("{}\n", graph.stats());

    let mut session = Session::new(graph, SessionConfig::default().learning_rate(0.05))?;
    session.add_epoch_listener(Box::new(|epoch: usize, loss: f32| {
        if epoch % 10 == 0 {
            println!("   Epoch {:3}: loss = {:.5}", epoch, loss);
        }
    }));

    let check = check_variable_gradient(&mut session, w, 0, &GradCheckConfig::default())?;
    println!("{}\n", check);

    let mut final_loss = 0.0;
    for epoch in 0..50 {
        final_loss = session.train_epoch(epoch)?;
    }

    println!("\n   Final loss: {:.5}", final_loss);
    println!("   Weights: {:?}", session.variable_data(w)?);
    println!("   Bias:    {:?}", session.variable_data(b)?);
    println!("   Backward peak: {} elements", session.arena_usage().backward_peak);
    Ok(())
}
