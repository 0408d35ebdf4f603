//! # strata-ad
//!
//! Layered reverse-mode automatic differentiation over a fixed-capacity arena.
//!
//! This crate provides:
//! - A [`GraphBuilder`] for static computation graphs (inputs, constants,
//!   variables, add, Hadamard, matmul, broadcast, activations, softmax and
//!   the cross-entropy / mean-squared-error costs)
//! - A [`GraphCompiler`] that fuses softmax into a following
//!   cross-entropy, assigns every node to a layer and sizes the arena from
//!   per-node memory declarations
//! - A [`Session`] that runs forward and backward passes entirely inside a
//!   [`MemoryArena`](strata_core::MemoryArena), with two alternating
//!   backward slots so backward memory is bounded by the widest layer
//! - Gradient optimizers (SGD with momentum, Adam/AMSGrad) driven per
//!   variable, and a finite-difference [`gradcheck`]
//!
//! ## Quick Start
//!
//! ```rust
//! use strata_ad::prelude::*;
//! use strata_core::shape;
//!
//! // y = W x with W = 0.5 everywhere and x = 1 everywhere
//! let mut g = GraphBuilder::new();
//! let w = g.variable(shape![3, 4], Initializer::Constant(0.5), Sgd::new(OptimizerConfig::sgd()))?;
//! let x = g.constant(shape![4, 1], vec![1.0; 4])?;
//! let y = g.matmul(w, x)?;
//!
//! let graph = GraphCompiler::default().compile(g, y)?;
//! let mut session = Session::new(graph, SessionConfig::default())?;
//! session.compute_gradients(0)?;
//!
//! assert_eq!(session.forward_output(y)?, &[2.0, 2.0, 2.0]);
//! assert_eq!(session.recorded_gradient(w)?, &[1.0; 12]);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Cost modes
//!
//! During training the terminal cost only needs its gradient, so by
//! default ([`CostMode::Training`]) its scalar is not computed. Switch to
//! [`CostMode::FullPass`] to get it on every step; evaluation always runs
//! the full pass.
//!
//! ## Features
//!
//! - `subscriber`: [`logging::init_tracing`] installs a `tracing-subscriber`
//!   formatter (pretty, compact or JSON)

pub mod builder;
pub mod compiler;
pub mod error;
mod fusion;
pub mod gradcheck;
pub mod logging;
pub mod node;
pub mod ops;
pub mod optimizers;
pub mod scheduler;
pub mod source;

pub use builder::GraphBuilder;
pub use compiler::{CompileStats, CompiledGraph, CompilerConfig, ExecNode, GraphCompiler, Slot};
pub use error::GraphError;
pub use node::{CostMode, NodeId, OpContext, Operation, Sides};
pub use ops::{Activation, ExecKind, Initializer};
pub use optimizers::{Adam, GradientOptimizer, OptimizerConfig, Sgd};
pub use scheduler::{Session, SessionConfig};
pub use source::{EpochListener, InMemorySource, MiniBatch, MiniBatchListener, MiniBatchSource};

pub mod prelude {
    //! Common imports for building and training graphs

    pub use crate::builder::GraphBuilder;
    pub use crate::compiler::{CompilerConfig, GraphCompiler};
    pub use crate::node::{CostMode, NodeId};
    pub use crate::ops::{Activation, Initializer};
    pub use crate::optimizers::{Adam, OptimizerConfig, Sgd};
    pub use crate::scheduler::{Session, SessionConfig};
    pub use crate::source::{InMemorySource, MiniBatchSource};
    pub use strata_kernels::{BroadcastAxis, SoftmaxAxis};
}
