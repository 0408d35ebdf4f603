//! # strata-core
//!
//! Memory primitives of the strata autodiff engine.
//!
//! This crate provides:
//! - [`Shape`] and rank helpers ([`shape::stride`], [`shape::broadcast_to_rank`],
//!   [`shape::cut_to_rank`], [`shape::matrix_dims`])
//! - [`TensorPointer`], a packed `(region, offset, length)` handle
//! - [`MemoryArena`], a bump arena with one forward region and two
//!   alternating backward slots, sized once and reused every step
//!
//! Nothing here knows about graphs or operators. The graph crate sizes the
//! arena at compile time and threads pointers through the nodes at run time.

pub mod address;
pub mod arena;
pub mod error;
pub mod shape;


pub use address::{RegionKind, TensorPointer};
pub use arena::{ArenaCapacity, ArenaUsage, ArenaView, BackwardRole, MemoryArena};
pub use error::{CoreError, CoreResult};
pub use shape::Shape;
