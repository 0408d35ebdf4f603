//! Graph compilation: fusion, layering, lowering and arena sizing
//!
//! [`GraphCompiler::compile`] turns a [`GraphBuilder`] into a
//! [`CompiledGraph`]:
//!
//! 1. **Fusion** - softmax/cross-entropy pairs become one stable node
//! 2. **Reachability** - nodes the terminal does not depend on are dropped
//! 3. **Layering** - every node gets its longest distance from the terminal
//!    (its depth) through a consumer-count traversal, so a shared ancestor
//!    always lands strictly deeper than each of its consumers. Forward
//!    evaluation walks layers from the deepest to the terminal; backward
//!    propagation walks them in reverse
//! 4. **Lowering** - builder operators become executable nodes and learn
//!    which operands need a gradient
//! 5. **Sizing** - the forward region holds every declared forward tensor of
//!    the step; a backward slot holds the largest single layer's declared
//!    backward tensors plus the pending gradients carried across it
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_ad::{CompilerConfig, GraphCompiler};
//!
//! let graph = GraphCompiler::new(CompilerConfig::default()).compile(builder, loss)?;
//! println!("{}", graph.stats());
//! ```

use crate::builder::{GraphBuilder, Op};
use crate::error::GraphError;
use crate::fusion::fuse_softmax_cross_entropy;
use crate::node::{total_elements, CostMode, NodeId, Sides};
use crate::ops::{
    ActivationNode, AddNode, BroadcastNode, ConstantNode, CrossEntropyNode, ExecKind, HadamardNode,
    InputNode, MatMulNode, MeanSquaredErrorNode, SoftmaxCrossEntropyNode, SoftmaxNode,
    VariableNode,
};
use crate::source::MiniBatchListener;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use strata_core::shape::{matrix_dims, stride};
use strata_core::{ArenaCapacity, Shape};
use strata_kernels::BroadcastAxis;
use tracing::{debug, info};

/// Compiler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Replace softmax/cross-entropy pairs with the fused node
    pub fuse_softmax_cross_entropy: bool,
    /// Fail instead of dropping nodes the terminal does not depend on
    pub reject_unreachable: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            fuse_softmax_cross_entropy: true,
            reject_unreachable: false,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep softmax and cross-entropy as separate nodes
    pub fn unfused() -> Self {
        Self::default().fusion(false)
    }

    /// Enable or disable the softmax/cross-entropy rewrite
    pub fn fusion(mut self, enabled: bool) -> Self {
        self.fuse_softmax_cross_entropy = enabled;
        self
    }

    /// Reject graphs with nodes unreachable from the terminal
    pub fn reject_unreachable(mut self, reject: bool) -> Self {
        self.reject_unreachable = reject;
        self
    }
}

/// Summary of one compilation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// Builder nodes before fusion
    pub nodes_before: usize,
    /// Executable nodes
    pub nodes_after: usize,
    /// Softmax/cross-entropy pairs fused
    pub fusions: usize,
    /// Nodes dropped as unreachable
    pub dropped: usize,
    /// Number of layers
    pub layers: usize,
    /// Forward region elements
    pub forward_capacity: usize,
    /// Backward slot elements
    pub backward_capacity: usize,
    /// Backward elements needed per depth, terminal first
    pub backward_per_layer: Vec<usize>,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Statistics:")?;
        writeln!(f, "  Nodes: {} -> {}", self.nodes_before, self.nodes_after)?;
        writeln!(f, "  Fusions: {}", self.fusions)?;
        writeln!(f, "  Dropped: {}", self.dropped)?;
        writeln!(f, "  Layers: {}", self.layers)?;
        writeln!(f, "  Forward capacity: {} elements", self.forward_capacity)?;
        write!(f, "  Backward capacity: {} elements per slot", self.backward_capacity)
    }
}

/// A lowered node with its wiring and schedule position
pub struct ExecNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kind: ExecKind,
    pub(crate) left: Option<NodeId>,
    pub(crate) right: Option<NodeId>,
    pub(crate) shape: Shape,
    pub(crate) depth: usize,
    pub(crate) layer: usize,
    pub(crate) sides: Sides,
    pub(crate) requires_backward: bool,
}

impl ExecNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ExecKind {
        &self.kind
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Predecessors, left first
    pub fn operands(&self) -> impl Iterator<Item = NodeId> {
        self.left.into_iter().chain(self.right)
    }

    /// Forward evaluation layer (leaves lowest)
    pub fn layer(&self) -> usize {
        self.layer
    }

    /// Longest distance from the terminal
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether the node receives a gradient
    pub fn requires_backward(&self) -> bool {
        self.requires_backward
    }

    /// Operands that receive a contribution from this node
    pub fn sides(&self) -> Sides {
        self.sides
    }
}

/// What became of a builder node
pub enum Slot {
    Live(Box<ExecNode>),
    /// Replaced by the fused node `into`
    Fused { into: NodeId },
    /// Not reachable from the terminal
    Dropped,
}

/// Executable graph with its arena requirements
pub struct CompiledGraph {
    pub(crate) slots: Vec<Slot>,
    /// Node ids per forward layer
    pub(crate) layers: Vec<Vec<NodeId>>,
    pub(crate) terminal: NodeId,
    pub(crate) mode: CostMode,
    pub(crate) capacity: ArenaCapacity,
    pub(crate) stats: CompileStats,
}

impl CompiledGraph {
    /// The executable node behind `id`
    pub fn live(&self, id: NodeId) -> Result<&ExecNode> {
        match self.slots.get(id.0) {
            Some(Slot::Live(node)) => Ok(&**node),
            Some(Slot::Fused { into }) => {
                Err(GraphError::FusedAway { node: id, into: *into }.into())
            }
            Some(Slot::Dropped) => Err(GraphError::Unreachable(id).into()),
            None => Err(GraphError::UnknownNode(id).into()),
        }
    }

    pub(crate) fn live_mut(&mut self, id: NodeId) -> Result<&mut ExecNode> {
        match self.slots.get_mut(id.0) {
            Some(Slot::Live(node)) => Ok(&mut **node),
            Some(Slot::Fused { into }) => {
                Err(GraphError::FusedAway { node: id, into: *into }.into())
            }
            Some(Slot::Dropped) => Err(GraphError::Unreachable(id).into()),
            None => Err(GraphError::UnknownNode(id).into()),
        }
    }

    /// Executable nodes in forward order
    pub fn nodes(&self) -> impl Iterator<Item = &ExecNode> {
        self.layers.iter().flatten().filter_map(move |id| match &self.slots[id.0] {
            Slot::Live(node) => Some(&**node),
            _ => None,
        })
    }

    /// Node ids per forward layer, leaves first
    pub fn layers(&self) -> &[Vec<NodeId>] {
        &self.layers
    }

    /// Forward layer of `id`
    pub fn layer_of(&self, id: NodeId) -> Result<usize> {
        Ok(self.live(id)?.layer)
    }

    pub fn terminal(&self) -> NodeId {
        self.terminal
    }

    pub fn capacity(&self) -> ArenaCapacity {
        self.capacity
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    pub fn cost_mode(&self) -> CostMode {
        self.mode
    }

    pub fn set_cost_mode(&mut self, mode: CostMode) {
        self.mode = mode;
    }

    /// The terminal cost skips its scalar loss
    pub fn training_mode(&mut self) {
        self.set_cost_mode(CostMode::Training);
    }

    /// The terminal cost materialises its scalar loss
    pub fn full_pass_mode(&mut self) {
        self.set_cost_mode(CostMode::FullPass);
    }

    /// Register a mini-batch listener on an input node
    pub fn add_mini_batch_listener(
        &mut self,
        input: NodeId,
        listener: Box<dyn MiniBatchListener>,
    ) -> Result<()> {
        let node = self.live_mut(input)?;
        let actual = node.kind.kind_name();
        match node.kind.as_input_mut() {
            Some(input_node) => {
                input_node.add_listener(listener);
                Ok(())
            }
            None => Err(GraphError::WrongKind {
                node: input,
                expected: "input",
                actual,
            }
            .into()),
        }
    }

    /// Ids of live input nodes
    pub fn inputs(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.kind.as_input().is_some())
            .map(|n| n.id)
            .collect()
    }

    /// Ids of live variables
    pub fn variables(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.kind.as_variable().is_some())
            .map(|n| n.id)
            .collect()
    }
}

/// Nodes the terminal depends on, indexed by node id
pub(crate) fn reachable_from(builder: &GraphBuilder, terminal: NodeId) -> Result<Vec<bool>> {
    builder.node(terminal)?;
    let mut seen = vec![false; builder.nodes.len()];
    let mut stack = vec![terminal];
    seen[terminal.0] = true;
    while let Some(id) = stack.pop() {
        for operand in builder.node(id)?.operands() {
            if !seen[operand.0] {
                seen[operand.0] = true;
                stack.push(operand);
            }
        }
    }
    Ok(seen)
}

/// Longest distance from the terminal for every reachable node
///
/// A node is expanded only after all of its reachable consumers were, so its
/// depth is final when it is dequeued and it is visited exactly once.
fn depths(
    builder: &GraphBuilder,
    terminal: NodeId,
    reachable: &[bool],
) -> Result<Vec<Option<usize>>> {
    let n = builder.nodes.len();
    let mut waiting: Vec<usize> = builder
        .nodes
        .iter()
        .map(|node| node.successors.iter().filter(|s| reachable[s.0]).count())
        .collect();
    let mut depth = vec![None; n];
    depth[terminal.0] = Some(0);

    let mut queue = VecDeque::from([terminal]);
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        let d = depth[id.0].unwrap_or(0);
        for operand in builder.node(id)?.operands() {
            let entry = &mut depth[operand.0];
            *entry = Some(entry.map_or(d + 1, |e: usize| e.max(d + 1)));
            waiting[operand.0] -= 1;
            if waiting[operand.0] == 0 {
                queue.push_back(operand);
            }
        }
    }

    let expected = reachable.iter().filter(|&&r| r).count();
    if visited != expected {
        return Err(GraphError::InvalidGraph(format!(
            "layering visited {} of {} reachable nodes; the graph has a cycle",
            visited, expected
        ))
        .into());
    }
    Ok(depth)
}

/// Whether each reachable node's columns are the samples of a mini-batch
///
/// Inputs start batch-shaped. Elementwise operators keep the flag of either
/// operand, a matrix product keeps its right operand's columns and a
/// row broadcast keeps its vector's. Parameters, constants and column
/// broadcasts are not batch-shaped.
fn batch_shaped(builder: &GraphBuilder, depth: &[Option<usize>]) -> Vec<bool> {
    let mut order: Vec<usize> = (0..builder.nodes.len()).filter(|&i| depth[i].is_some()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(depth[i]));

    let mut batched = vec![false; builder.nodes.len()];
    for i in order {
        let node = &builder.nodes[i];
        let left = node.left.is_some_and(|l| batched[l.0]);
        let right = node.right.is_some_and(|r| batched[r.0]);
        batched[i] = match &node.op {
            Op::Input { .. } => true,
            Op::Add | Op::Hadamard => left || right,
            Op::MatMul => right,
            Op::Broadcast { axis } => *axis == BroadcastAxis::Rows && left,
            Op::Activation(_) | Op::Softmax { .. } => left,
            Op::CrossEntropy | Op::MeanSquaredError | Op::SoftmaxCrossEntropy { .. } => {
                left || right
            }
            Op::Constant { .. } | Op::Variable { .. } | Op::Retired { .. } => false,
        };
    }
    batched
}

fn lower(
    op: Op,
    shape: &Shape,
    left: Option<&Shape>,
    right: Option<&Shape>,
    batched: bool,
) -> Result<ExecKind> {
    let operand = |s: Option<&Shape>, which: &str| {
        s.cloned()
            .ok_or_else(|| GraphError::InvalidGraph(format!("missing {} operand", which)))
    };
    let (rows, cols) = matrix_dims(shape)?;

    Ok(match op {
        Op::Input { source, listeners } => {
            ExecKind::Input(InputNode::new(shape.clone(), source, listeners)?)
        }
        Op::Constant { values } => ExecKind::Constant(ConstantNode::new(shape.clone(), values)),
        Op::Variable { data, optimizer } => {
            ExecKind::Variable(VariableNode::new(shape.clone(), data, optimizer)?)
        }
        Op::Add => ExecKind::Add(AddNode::new(shape.clone())),
        Op::Hadamard => ExecKind::Hadamard(HadamardNode::new(shape.clone())),
        Op::MatMul => {
            let (m, k) = matrix_dims(&operand(left, "left")?)?;
            let (_, n) = matrix_dims(&operand(right, "right")?)?;
            ExecKind::MatMul(MatMulNode::new(m, k, n))
        }
        Op::Broadcast { axis } => {
            ExecKind::Broadcast(BroadcastNode::new(axis, operand(left, "vector")?, rows, cols))
        }
        Op::Activation(function) => {
            ExecKind::Activation(ActivationNode::new(function, shape.clone()))
        }
        Op::Softmax { axis } => ExecKind::Softmax(SoftmaxNode::new(axis, rows, cols)),
        Op::CrossEntropy => {
            let (r, c) = matrix_dims(&operand(left, "prediction")?)?;
            ExecKind::CrossEntropy(CrossEntropyNode::new(r, c).batch_shaped(batched))
        }
        Op::MeanSquaredError => {
            let (r, c) = matrix_dims(&operand(left, "prediction")?)?;
            ExecKind::MeanSquaredError(MeanSquaredErrorNode::new(r, c).batch_shaped(batched))
        }
        Op::SoftmaxCrossEntropy { axis } => {
            let (r, c) = matrix_dims(&operand(left, "logits")?)?;
            let node = SoftmaxCrossEntropyNode::new(axis, r, c).batch_shaped(batched);
            ExecKind::SoftmaxCrossEntropy(node)
        }
        Op::Retired { into } => {
            return Err(GraphError::InvalidGraph(format!(
                "retired node lowered, it was fused into {}",
                into
            ))
            .into())
        }
    })
}

/// Compiles builders into executable graphs
#[derive(Debug, Clone, Default)]
pub struct GraphCompiler {
    config: CompilerConfig,
}

impl GraphCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile everything `terminal` depends on
    #[tracing::instrument(skip(self, builder), fields(nodes = builder.len()))]
    pub fn compile(&self, mut builder: GraphBuilder, terminal: NodeId) -> Result<CompiledGraph> {
        let nodes_before = builder.len();
        let mut terminal = terminal;

        let fusions = if self.config.fuse_softmax_cross_entropy {
            fuse_softmax_cross_entropy(&mut builder, &mut terminal)?
        } else {
            0
        };

        let reachable = reachable_from(&builder, terminal)?;
        if self.config.reject_unreachable {
            let stray = builder
                .nodes
                .iter()
                .enumerate()
                .find(|(i, node)| !reachable[*i] && !matches!(node.op, Op::Retired { .. }));
            if let Some((i, _)) = stray {
                return Err(GraphError::Unreachable(NodeId(i)).into());
            }
        }

        let depth = depths(&builder, terminal, &reachable)?;
        let layer_count = depth.iter().flatten().max().map_or(0, |&d| d + 1);
        debug!(layers = layer_count, fusions, "layered graph");

        // Lower every node, consuming the builder
        let batched = batch_shaped(&builder, &depth);
        let shapes: Vec<Shape> = builder.nodes.iter().map(|n| n.shape.clone()).collect();
        let mut slots = Vec::with_capacity(builder.nodes.len());
        let mut dropped = 0;
        for (i, node) in builder.nodes.into_iter().enumerate() {
            let id = NodeId(i);
            if let Op::Retired { into } = node.op {
                slots.push(Slot::Fused { into });
                continue;
            }
            let Some(d) = depth[i] else {
                debug!(node = %id, name = %node.name, "dropping unreachable node");
                dropped += 1;
                slots.push(Slot::Dropped);
                continue;
            };
            let left = node.left.map(|l| &shapes[l.0]);
            let right = node.right.map(|r| &shapes[r.0]);
            let kind = lower(node.op, &node.shape, left, right, batched[i])
                .with_context(|| format!("lowering {} ({})", id, node.name))?;
            slots.push(Slot::Live(Box::new(ExecNode {
                id,
                name: node.name,
                kind,
                left: node.left,
                right: node.right,
                shape: node.shape,
                depth: d,
                layer: layer_count - 1 - d,
                sides: Sides::default(),
                requires_backward: false,
            })));
        }

        let mut layers: Vec<Vec<NodeId>> = vec![Vec::new(); layer_count];
        for slot in &slots {
            if let Slot::Live(node) = slot {
                layers[node.layer].push(node.id);
            }
        }

        let mut graph = CompiledGraph {
            slots,
            layers,
            terminal,
            mode: CostMode::Training,
            capacity: ArenaCapacity::new(0, 0),
            stats: CompileStats::default(),
        };
        propagate_requirements(&mut graph)?;

        let (capacity, backward_per_layer) = size_arena(&graph)?;
        graph.capacity = capacity;
        graph.stats = CompileStats {
            nodes_before,
            nodes_after: graph.layers.iter().map(Vec::len).sum(),
            fusions,
            dropped,
            layers: layer_count,
            forward_capacity: capacity.forward,
            backward_capacity: capacity.backward,
            backward_per_layer,
        };
        info!(
            forward = capacity.forward,
            backward = capacity.backward,
            layers = layer_count,
            nodes = graph.stats.nodes_after,
            "compiled graph"
        );
        Ok(graph)
    }
}

/// Decide, leaves first, which nodes receive a gradient
fn propagate_requirements(graph: &mut CompiledGraph) -> Result<()> {
    let order: Vec<NodeId> = graph.layers.iter().flatten().copied().collect();
    let mut requires = vec![false; graph.slots.len()];
    for id in order {
        let node = graph.live_mut(id)?;
        let sides = Sides::new(
            node.left.is_some_and(|l| requires[l.0]),
            node.right.is_some_and(|r| requires[r.0]),
        );
        node.sides = sides;
        node.requires_backward = node.kind.operation().requires_backward_value(sides);
        requires[id.0] = node.requires_backward;
    }
    Ok(())
}

/// Forward capacity and per-depth backward usage
fn size_arena(graph: &CompiledGraph) -> Result<(ArenaCapacity, Vec<usize>)> {
    let depth_count = graph.layers.len();
    let mut forward = 0;
    let mut usage = vec![0usize; depth_count];
    // Depths of the consumers of each node
    let mut consumer_depths: Vec<Vec<usize>> = vec![Vec::new(); graph.slots.len()];

    for node in graph.nodes() {
        let op = node.kind.operation();
        forward += total_elements(&op.forward_memory());
        if node.requires_backward {
            usage[node.depth] += total_elements(&op.backward_memory(node.sides));
        }
        for operand in node.left.into_iter().chain(node.right) {
            consumer_depths[operand.0].push(node.depth);
        }
    }

    let terminal = graph.live(graph.terminal)?;
    if terminal.requires_backward && !terminal.kind.operation().is_cost() && depth_count > 0 {
        usage[0] += stride(&terminal.shape);
    }

    // A pending gradient written at depth d - 1 that is not replaced at d is
    // copied into the current slot before the swap at the end of d
    for node in graph.nodes().filter(|n| n.requires_backward) {
        let consumers = &consumer_depths[node.id.0];
        let Some(&first) = consumers.iter().min() else {
            continue;
        };
        for d in (first + 1)..node.depth {
            if !consumers.contains(&d) {
                usage[d] += stride(&node.shape);
            }
        }
    }

    let backward = usage.iter().copied().max().unwrap_or(0);
    for (d, &elements) in usage.iter().enumerate() {
        debug!(depth = d, elements, "backward layer usage");
    }
    Ok((ArenaCapacity::new(forward, backward), usage))
}
