//! Executable operation nodes
//!
//! Every node here implements [`Operation`]. The compiler lowers builder
//! operators into an [`ExecKind`], a closed sum over the node types, so the
//! scheduler dispatches with an exhaustive match instead of trait objects in
//! the graph. Unfused softmax and cross-entropy nodes that were replaced by a
//! [`SoftmaxCrossEntropyNode`] never reach this enum.

pub mod activation;
pub mod arithmetic;
pub mod broadcast;
pub mod cost;
pub mod data;
pub mod matmul;
pub mod softmax;
pub mod variable;

pub use activation::{Activation, ActivationNode};
pub use arithmetic::{AddNode, HadamardNode};
pub use broadcast::BroadcastNode;
pub use cost::{CrossEntropyNode, MeanSquaredErrorNode, SoftmaxCrossEntropyNode};
pub use data::{ConstantNode, InputNode};
pub use matmul::MatMulNode;
pub use softmax::SoftmaxNode;
pub use variable::{Initializer, VariableNode};

use crate::node::Operation;

/// A lowered, executable node
pub enum ExecKind {
    Input(InputNode),
    Constant(ConstantNode),
    Variable(VariableNode),
    Add(AddNode),
    Hadamard(HadamardNode),
    MatMul(MatMulNode),
    Broadcast(BroadcastNode),
    Activation(ActivationNode),
    Softmax(SoftmaxNode),
    CrossEntropy(CrossEntropyNode),
    MeanSquaredError(MeanSquaredErrorNode),
    SoftmaxCrossEntropy(SoftmaxCrossEntropyNode),
}

impl ExecKind {
    pub fn operation(&self) -> &dyn Operation {
        match self {
            ExecKind::Input(n) => n,
            ExecKind::Constant(n) => n,
            ExecKind::Variable(n) => n,
            ExecKind::Add(n) => n,
            ExecKind::Hadamard(n) => n,
            ExecKind::MatMul(n) => n,
            ExecKind::Broadcast(n) => n,
            ExecKind::Activation(n) => n,
            ExecKind::Softmax(n) => n,
            ExecKind::CrossEntropy(n) => n,
            ExecKind::MeanSquaredError(n) => n,
            ExecKind::SoftmaxCrossEntropy(n) => n,
        }
    }

    pub fn operation_mut(&mut self) -> &mut dyn Operation {
        match self {
            ExecKind::Input(n) => n,
            ExecKind::Constant(n) => n,
            ExecKind::Variable(n) => n,
            ExecKind::Add(n) => n,
            ExecKind::Hadamard(n) => n,
            ExecKind::MatMul(n) => n,
            ExecKind::Broadcast(n) => n,
            ExecKind::Activation(n) => n,
            ExecKind::Softmax(n) => n,
            ExecKind::CrossEntropy(n) => n,
            ExecKind::MeanSquaredError(n) => n,
            ExecKind::SoftmaxCrossEntropy(n) => n,
        }
    }

    /// Kind name used in error messages
    pub fn kind_name(&self) -> &'static str {
        self.operation().name()
    }

    pub fn as_variable(&self) -> Option<&VariableNode> {
        match self {
            ExecKind::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_variable_mut(&mut self) -> Option<&mut VariableNode> {
        match self {
            ExecKind::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_input(&self) -> Option<&InputNode> {
        match self {
            ExecKind::Input(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_input_mut(&mut self) -> Option<&mut InputNode> {
        match self {
            ExecKind::Input(i) => Some(i),
            _ => None,
        }
    }
}
