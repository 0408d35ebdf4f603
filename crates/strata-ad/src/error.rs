//! Error types for graph construction, compilation and execution
//!
//! The public API of this crate returns [`anyhow::Result`]. Every failure is
//! rooted in one of the typed errors below (or a [`strata_core::CoreError`] /
//! [`strata_kernels::KernelError`]) and wrapped with the node and operator
//! it happened in, so callers can `downcast_ref` to react programmatically.

use crate::node::NodeId;
use thiserror::Error;

/// Errors raised by the graph layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Predecessor shapes are incompatible for an operator
    #[error("shape mismatch in {op}: {left:?} vs {right:?} ({reason})")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
        reason: String,
    },

    /// The fusion pass matched a pattern whose wiring or shapes are inconsistent
    #[error("invalid rewrite of softmax {softmax} into cross-entropy {consumer}: {reason}")]
    InvalidRewrite {
        softmax: NodeId,
        consumer: NodeId,
        reason: String,
    },

    /// A node id that was never issued by the builder
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The node was replaced by a fused composite during compilation
    #[error("{node} was fused into {into} during compilation and cannot be used directly")]
    FusedAway { node: NodeId, into: NodeId },

    /// The node is not reachable from the terminal and was dropped
    #[error("{0} is not reachable from the terminal node")]
    Unreachable(NodeId),

    /// An input-only operation was requested on another kind of node
    #[error("{node} is a {actual} node, expected {expected}")]
    WrongKind {
        node: NodeId,
        expected: &'static str,
        actual: &'static str,
    },

    /// The graph structure cannot be executed
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// A gradient contribution was not written to the current backward slot
    #[error("gradient contribution for {node} was not allocated in the current backward slot")]
    MisplacedGradient { node: NodeId },

    /// A mini-batch index outside the data set
    #[error("mini-batch {index} is out of range ({count} batches)")]
    BatchOutOfRange { index: usize, count: usize },

    /// A previous step failed; the session refuses further work
    #[error("session is poisoned by an earlier failure: {reason}")]
    SessionPoisoned { reason: String },
}

impl GraphError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(
        op: &'static str,
        left: &[usize],
        right: &[usize],
        reason: impl Into<String>,
    ) -> Self {
        GraphError::ShapeMismatch {
            op,
            left: left.to_vec(),
            right: right.to_vec(),
            reason: reason.into(),
        }
    }

    /// Create an invalid rewrite error
    pub fn invalid_rewrite(softmax: NodeId, consumer: NodeId, reason: impl Into<String>) -> Self {
        GraphError::InvalidRewrite {
            softmax,
            consumer,
            reason: reason.into(),
        }
    }

    /// Check whether this error refers to a node removed by fusion
    pub fn is_fused_away(&self) -> bool {
        matches!(self, GraphError::FusedAway { .. })
    }
}
