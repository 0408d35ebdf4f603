//! Property-based tests for compilation and execution
//!
//! Uses proptest to check fusion, layering and arena sizing across random
//! graphs and inputs.

use anyhow::Result;
use proptest::prelude::*;
use strata_ad::prelude::*;
use strata_core::shape;

fn sgd() -> Sgd {
    Sgd::new(OptimizerConfig::sgd())
}

/// `cross_entropy(softmax(logits), one_hot(labels))` with the logits as a variable
fn softmax_loss(
    config: CompilerConfig,
    classes: usize,
    logits: &[f32],
    labels: &[usize],
) -> Result<(Session, NodeId)> {
    let samples = labels.len();
    let mut target = vec![0.0; classes * samples];
    for (col, &label) in labels.iter().enumerate() {
        target[label * samples + col] = 1.0;
    }

    let mut g = GraphBuilder::new();
    let x = g.variable(shape![classes, samples], Initializer::Values(logits.to_vec()), sgd())?;
    let t = g.constant(shape![classes, samples], target)?;
    let p = g.softmax(x, SoftmaxAxis::Columns)?;
    let loss = g.cross_entropy(p, t)?;
    let graph = GraphCompiler::new(config).compile(g, loss)?;
    Ok((Session::new(graph, SessionConfig::default())?, x))
}

fn softmax_case() -> impl Strategy<Value = (usize, Vec<f32>, Vec<usize>)> {
    (2usize..6, 1usize..5).prop_flat_map(|(classes, samples)| {
        (
            Just(classes),
            prop::collection::vec(-2.0f32..2.0, classes * samples),
            prop::collection::vec(0..classes, samples),
        )
    })
}

/// Operator choices for random graphs
#[derive(Debug, Clone, Copy)]
enum Step {
    Add(usize, usize),
    Hadamard(usize, usize),
    Tanh(usize),
}

fn random_graph() -> impl Strategy<Value = (Vec<f32>, Vec<Step>)> {
    let step = prop_oneof![
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Step::Add(a, b)),
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Step::Hadamard(a, b)),
        any::<usize>().prop_map(Step::Tanh),
    ];
    (
        prop::collection::vec(-1.0f32..1.0, 6),
        prop::collection::vec(step, 1..10),
    )
}

/// Three `[2]` variables followed by `steps`; operand indices wrap onto
/// earlier nodes and the last node is the terminal
fn build_random(values: &[f32], steps: &[Step]) -> Result<(GraphBuilder, NodeId)> {
    let mut g = GraphBuilder::new();
    let mut ids = Vec::new();
    for chunk in values.chunks(2) {
        ids.push(g.variable(shape![2], Initializer::Values(chunk.to_vec()), sgd())?);
    }
    for step in steps {
        let n = ids.len();
        let id = match *step {
            Step::Add(a, b) => g.add(ids[a % n], ids[b % n])?,
            Step::Hadamard(a, b) => g.hadamard(ids[a % n], ids[b % n])?,
            Step::Tanh(a) => g.activation(ids[a % n], Activation::Tanh)?,
        };
        ids.push(id);
    }
    let terminal = *ids.last().ok_or_else(|| anyhow::anyhow!("empty graph"))?;
    Ok((g, terminal))
}

proptest! {
    /// The fused node reproduces the unfused gradient and needs less backward memory
    #[test]
    fn test_fusion_equivalence((classes, logits, labels) in softmax_case()) {
        let (mut fused, xf) =
            softmax_loss(CompilerConfig::default(), classes, &logits, &labels).unwrap();
        let (mut reference, xr) =
            softmax_loss(CompilerConfig::unfused(), classes, &logits, &labels).unwrap();

        fused.compute_gradients(0).unwrap();
        reference.compute_gradients(0).unwrap();
        let gf = fused.recorded_gradient(xf).unwrap();
        let gr = reference.recorded_gradient(xr).unwrap();
        for (a, b) in gf.iter().zip(gr) {
            prop_assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }

        let lf = fused.evaluate_batch(0).unwrap();
        let lr = reference.evaluate_batch(0).unwrap();
        prop_assert!((lf - lr).abs() < 1e-4 * lr.abs().max(1.0), "{} vs {}", lf, lr);

        prop_assert!(fused.graph().capacity().backward < reference.graph().capacity().backward);
    }

    /// Every operand is evaluated in an earlier layer than its consumer
    #[test]
    fn test_layer_dependency_ordering((values, steps) in random_graph()) {
        let (g, terminal) = build_random(&values, &steps).unwrap();
        let graph = GraphCompiler::default().compile(g, terminal).unwrap();

        for node in graph.nodes() {
            for operand in node.operands() {
                prop_assert!(graph.layer_of(operand).unwrap() < node.layer());
                prop_assert!(graph.live(operand).unwrap().depth() > node.depth());
            }
        }
        prop_assert_eq!(graph.layer_of(terminal).unwrap() + 1, graph.layers().len());
    }

    /// Backward never outgrows the slot size the compiler computed
    #[test]
    fn test_backward_fits_compiled_capacity((values, steps) in random_graph()) {
        let (g, terminal) = build_random(&values, &steps).unwrap();
        let graph = GraphCompiler::default().compile(g, terminal).unwrap();
        let capacity = graph.capacity();
        let variables = graph.variables();
        let mut session = Session::new(graph, SessionConfig::default()).unwrap();

        session.compute_gradients(0).unwrap();
        let usage = session.arena_usage();
        prop_assert!(usage.forward <= capacity.forward);
        prop_assert!(usage.backward_peak <= capacity.backward);
        for variable in variables {
            prop_assert_eq!(session.recorded_gradient(variable).unwrap().len(), 2);
        }
    }
}

#[test]
fn test_forward_addresses_stable_over_many_steps() -> Result<()> {
    let mut g = GraphBuilder::new();
    let x = g.input(
        Box::new(InMemorySource::new(3, (0..30).map(|i| i as f32 * 0.1).collect())?),
        4,
    )?;
    let t = g.input(Box::new(InMemorySource::one_hot(&[0, 1, 2, 0, 1, 2, 0, 1, 2, 0], 3)?), 4)?;
    let w = g.variable(
        shape![3, 3],
        Initializer::XavierUniform { seed: 3 },
        Adam::new(OptimizerConfig::adam()),
    )?;
    let h = g.matmul(w, x)?;
    let p = g.softmax(h, SoftmaxAxis::Columns)?;
    let loss = g.cross_entropy(p, t)?;
    let graph = GraphCompiler::default().compile(g, loss)?;
    let mut session = Session::new(graph, SessionConfig::default().learning_rate(0.01))?;

    session.train_step(0)?;
    let first = session.forward_pointers().to_vec();
    for step in 0..1000 {
        session.train_step(step % session.batch_count())?;
        assert_eq!(session.forward_pointers(), first.as_slice(), "step {}", step);
    }
    Ok(())
}
