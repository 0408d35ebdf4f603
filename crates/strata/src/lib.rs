//! # strata
//!
//! Arena-backed reverse-mode automatic differentiation.
//!
//! This is the **meta crate** that re-exports all strata components for
//! convenient access.
//!
//! ## Quick Start
//!
//! ```
//! use strata::prelude::*;
//!
//! // Fit y = 3x with one weight
//! let mut g = GraphBuilder::new();
//! let x = g.input(Box::new(InMemorySource::new(1, vec![1.0, 2.0, 3.0, 4.0])?), 4)?;
//! let y = g.input(Box::new(InMemorySource::new(1, vec![3.0, 6.0, 9.0, 12.0])?), 4)?;
//! let w = g.variable(shape![1, 1], Initializer::Zeros, Sgd::new(OptimizerConfig::sgd()))?;
//! let prediction = g.matmul(w, x)?;
//! let loss = g.mean_squared_error(prediction, y)?;
//!
//! let graph = GraphCompiler::default().compile(g, loss)?;
//! let mut session = Session::new(graph, SessionConfig::default().learning_rate(0.05))?;
//! for epoch in 0..100 {
//!     session.train_epoch(epoch)?;
//! }
//! assert!((session.variable_data(w)?[0] - 3.0).abs() < 1e-3);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Components
//!
//! ### Memory ([`core`])
//!
//! Shapes, packed tensor pointers and the [`MemoryArena`](core::MemoryArena)
//! with one forward region and two alternating backward slots.
//!
//! ### Kernels ([`kernels`])
//!
//! GEMM, tiled transpose, broadcast/reduce, elementwise operations and a
//! numerically stable softmax over offset matrix views.
//!
//! ### Autodiff ([`ad`])
//!
//! Graph builder, compiler (softmax/cross-entropy fusion, layering, arena
//! sizing), execution session, optimizers and gradient checking.
//!
//! ## Features
//!
//! - `subscriber`: install a `tracing-subscriber` formatter with
//!   [`ad::logging::init_tracing`]

pub use strata_ad as ad;
pub use strata_core as core;
pub use strata_kernels as kernels;

pub mod prelude {
    //! Prelude module for convenient imports
    //!
    //! # Example
    //!
    //! ```
    //! use strata::prelude::*;
    //!
    //! let mut g = GraphBuilder::new();
    //! let v = g.constant(shape![2, 2], vec![1.0; 4])?;
    //! assert_eq!(g.shape_of(v)?.as_slice(), &[2, 2]);
    //! # Ok::<(), anyhow::Error>(())
    //! ```

    // Memory
    pub use crate::core::{shape, ArenaCapacity, MemoryArena, Shape, TensorPointer};

    // Graph construction and execution
    pub use crate::ad::prelude::*;
    pub use crate::ad::{CompiledGraph, GraphError};

    // Gradient checking
    pub use crate::ad::gradcheck::{check_variable_gradient, GradCheckConfig};
}
