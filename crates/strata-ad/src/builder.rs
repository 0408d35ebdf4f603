//! Graph construction
//!
//! [`GraphBuilder`] records operators in an index arena. Every constructor
//! checks its operand shapes on the spot and registers the new node as a
//! successor of its operands, so the builder always holds a consistent
//! predecessor/successor skeleton for the compiler to rewrite and layer.
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_ad::{GraphBuilder, Initializer, InMemorySource, Sgd, OptimizerConfig};
//! use strata_kernels::{BroadcastAxis, SoftmaxAxis};
//!
//! let mut g = GraphBuilder::new();
//! let x = g.input(Box::new(features), 32)?;
//! let t = g.input(Box::new(labels), 32)?;
//! let init = Initializer::XavierUniform { seed: 7 };
//! let w = g.variable(shape![10, 784], init, Sgd::new(OptimizerConfig::sgd()))?;
//! let b = g.variable(shape![10, 1], Initializer::Zeros, Sgd::new(OptimizerConfig::sgd()))?;
//! let z = g.matmul(w, x)?;
//! let bb = g.broadcast(b, BroadcastAxis::Columns, 10, 32)?;
//! let logits = g.add(z, bb)?;
//! let p = g.softmax(logits, SoftmaxAxis::Columns)?;
//! let loss = g.cross_entropy(p, t)?;
//! ```

use crate::error::GraphError;
use crate::node::NodeId;
use crate::ops::{Activation, Initializer};
use crate::optimizers::GradientOptimizer;
use crate::source::{MiniBatchListener, MiniBatchSource};
use anyhow::Result;
use strata_core::shape::{matrix_dims, stride};
use strata_core::{shape, Shape};
use strata_kernels::{BroadcastAxis, SoftmaxAxis};

/// Builder-level operator
///
/// Owns whatever the executable node will own (sources, weights,
/// optimizers) until the compiler lowers it.
pub(crate) enum Op {
    Input {
        source: Box<dyn MiniBatchSource>,
        listeners: Vec<Box<dyn MiniBatchListener>>,
    },
    Constant {
        values: Vec<f32>,
    },
    Variable {
        data: Vec<f32>,
        optimizer: Box<dyn GradientOptimizer>,
    },
    Add,
    Hadamard,
    MatMul,
    Broadcast {
        axis: BroadcastAxis,
    },
    Activation(Activation),
    Softmax {
        axis: SoftmaxAxis,
    },
    CrossEntropy,
    MeanSquaredError,
    SoftmaxCrossEntropy {
        axis: SoftmaxAxis,
    },
    /// Replaced by a fused node
    Retired {
        into: NodeId,
    },
}

impl Op {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Constant { .. } => "constant",
            Op::Variable { .. } => "variable",
            Op::Add => "add",
            Op::Hadamard => "hadamard",
            Op::MatMul => "matmul",
            Op::Broadcast { .. } => "broadcast",
            Op::Activation(_) => "activation",
            Op::Softmax { .. } => "softmax",
            Op::CrossEntropy => "cross_entropy",
            Op::MeanSquaredError => "mean_squared_error",
            Op::SoftmaxCrossEntropy { .. } => "softmax_cross_entropy",
            Op::Retired { .. } => "retired",
        }
    }

    /// Leaves have no operands and never receive a contribution from one
    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Op::Input { .. } | Op::Constant { .. } | Op::Variable { .. })
    }
}

/// One recorded operator with its wiring
pub(crate) struct BuilderNode {
    pub(crate) name: String,
    pub(crate) op: Op,
    pub(crate) left: Option<NodeId>,
    pub(crate) right: Option<NodeId>,
    pub(crate) shape: Shape,
    pub(crate) successors: Vec<NodeId>,
}

impl BuilderNode {
    pub(crate) fn operands(&self) -> impl Iterator<Item = NodeId> {
        self.left.into_iter().chain(self.right)
    }
}

/// Records a computation graph before compilation
#[derive(Default)]
pub struct GraphBuilder {
    pub(crate) nodes: Vec<BuilderNode>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Output shape of `id`
    pub fn shape_of(&self, id: NodeId) -> Result<&Shape> {
        Ok(&self.node(id)?.shape)
    }

    /// Consumers of `id`
    pub fn successors(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(&self.node(id)?.successors)
    }

    /// Rename a node for logs and statistics
    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.name = name.into();
        Ok(())
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<&BuilderNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| GraphError::UnknownNode(id).into())
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut BuilderNode> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| GraphError::UnknownNode(id).into())
    }

    /// Append a node and register it with its operands
    pub(crate) fn push(
        &mut self,
        op: Op,
        left: Option<NodeId>,
        right: Option<NodeId>,
        shape: Shape,
    ) -> Result<NodeId> {
        let id = NodeId(self.nodes.len());
        for operand in left.into_iter().chain(right) {
            self.node(operand)?;
        }
        // An operand used on both sides gets one entry per edge
        for operand in left.into_iter().chain(right) {
            self.node_mut(operand)?.successors.push(id);
        }
        let name = format!("{}{}", op.kind_name(), id.0);
        self.nodes.push(BuilderNode {
            name,
            op,
            left,
            right,
            shape,
            successors: Vec::new(),
        });
        Ok(id)
    }

    /// Mini-batch input of shape `[features, max_batch]`
    pub fn input(&mut self, source: Box<dyn MiniBatchSource>, max_batch: usize) -> Result<NodeId> {
        if max_batch == 0 {
            let reason = "input batch capacity must be positive".to_string();
            return Err(GraphError::InvalidGraph(reason).into());
        }
        let shape = shape![source.features(), max_batch];
        self.push(
            Op::Input {
                source,
                listeners: Vec::new(),
            },
            None,
            None,
            shape,
        )
    }

    /// Register a mini-batch listener on an input node
    pub fn add_mini_batch_listener(
        &mut self,
        input: NodeId,
        listener: Box<dyn MiniBatchListener>,
    ) -> Result<()> {
        let node = self.node_mut(input)?;
        match &mut node.op {
            Op::Input { listeners, .. } => {
                listeners.push(listener);
                Ok(())
            }
            other => Err(GraphError::WrongKind {
                node: input,
                expected: "input",
                actual: other.kind_name(),
            }
            .into()),
        }
    }

    /// Fixed tensor
    pub fn constant(&mut self, shape: Shape, values: Vec<f32>) -> Result<NodeId> {
        if values.len() != stride(&shape) {
            return Err(GraphError::shape_mismatch(
                "constant",
                &shape,
                &[values.len()],
                "value count does not match the shape",
            )
            .into());
        }
        self.push(Op::Constant { values }, None, None, shape)
    }

    /// Trainable tensor updated by `optimizer`
    pub fn variable(
        &mut self,
        shape: Shape,
        init: Initializer,
        optimizer: impl GradientOptimizer + 'static,
    ) -> Result<NodeId> {
        let data = init.materialize(&shape)?;
        self.push(
            Op::Variable {
                data,
                optimizer: Box::new(optimizer),
            },
            None,
            None,
            shape,
        )
    }

    fn same_shape(&self, op: &'static str, left: NodeId, right: NodeId) -> Result<Shape> {
        let (l, r) = (&self.node(left)?.shape, &self.node(right)?.shape);
        if l != r {
            return Err(GraphError::shape_mismatch(
                op,
                l,
                r,
                "operands must have identical shapes",
            )
            .into());
        }
        Ok(l.clone())
    }

    fn matrix(&self, op: &'static str, id: NodeId) -> Result<(usize, usize)> {
        let shape = &self.node(id)?.shape;
        matrix_dims(shape).map_err(|_| {
            GraphError::shape_mismatch(op, shape, &[], "operand is not a matrix").into()
        })
    }

    /// `left + right`
    pub fn add(&mut self, left: NodeId, right: NodeId) -> Result<NodeId> {
        let shape = self.same_shape("add", left, right)?;
        self.push(Op::Add, Some(left), Some(right), shape)
    }

    /// `left ⊙ right`
    pub fn hadamard(&mut self, left: NodeId, right: NodeId) -> Result<NodeId> {
        let shape = self.same_shape("hadamard", left, right)?;
        self.push(Op::Hadamard, Some(left), Some(right), shape)
    }

    /// `left · right`
    pub fn matmul(&mut self, left: NodeId, right: NodeId) -> Result<NodeId> {
        let (m, k) = self.matrix("matmul", left)?;
        let (k2, n) = self.matrix("matmul", right)?;
        if k != k2 {
            return Err(GraphError::shape_mismatch(
                "matmul",
                &self.node(left)?.shape,
                &self.node(right)?.shape,
                "inner dimensions differ",
            )
            .into());
        }
        self.push(Op::MatMul, Some(left), Some(right), shape![m, n])
    }

    /// Replicate a vector across a `[rows, cols]` matrix
    pub fn broadcast(
        &mut self,
        vector: NodeId,
        axis: BroadcastAxis,
        rows: usize,
        cols: usize,
    ) -> Result<NodeId> {
        let v = &self.node(vector)?.shape;
        let expected = axis.vector_len(rows, cols);
        if stride(v) != expected {
            return Err(GraphError::shape_mismatch(
                "broadcast",
                v,
                &[rows, cols],
                format!("broadcast along {} needs a vector of {} elements", axis, expected),
            )
            .into());
        }
        self.push(Op::Broadcast { axis }, Some(vector), None, shape![rows, cols])
    }

    /// Elementwise activation
    pub fn activation(&mut self, input: NodeId, function: Activation) -> Result<NodeId> {
        let shape = self.node(input)?.shape.clone();
        self.push(Op::Activation(function), Some(input), None, shape)
    }

    /// Stable softmax over the lanes of `axis`
    pub fn softmax(&mut self, input: NodeId, axis: SoftmaxAxis) -> Result<NodeId> {
        let (rows, cols) = self.matrix("softmax", input)?;
        self.push(Op::Softmax { axis }, Some(input), None, shape![rows, cols])
    }

    /// `-Σ target · ln(prediction)`
    pub fn cross_entropy(&mut self, prediction: NodeId, target: NodeId) -> Result<NodeId> {
        self.cost("cross_entropy", Op::CrossEntropy, prediction, target)
    }

    /// `½ Σ (prediction - target)²`
    pub fn mean_squared_error(&mut self, prediction: NodeId, target: NodeId) -> Result<NodeId> {
        self.cost("mean_squared_error", Op::MeanSquaredError, prediction, target)
    }

    fn cost(
        &mut self,
        name: &'static str,
        op: Op,
        prediction: NodeId,
        target: NodeId,
    ) -> Result<NodeId> {
        self.same_shape(name, prediction, target)?;
        self.matrix(name, prediction)?;
        self.push(op, Some(prediction), Some(target), shape![1, 1])
    }
}
