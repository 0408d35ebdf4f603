//! # strata-kernels
//!
//! Dense numeric kernels for the strata autodiff engine.
//!
//! Matrix kernels operate on offset views ([`MatRef`], [`MatMut`]) into larger
//! backing buffers, so the graph can keep every tensor of a step inside a
//! single arena region. No kernel allocates.
//!
//! **Key Features:**
//! - **GEMM** - `C = A · B` in row-major order with explicit offsets
//! - **Transpose** - cache-tiled, out-of-place
//! - **Broadcast / reduce** - vector replication and its exact adjoint
//! - **Elementwise** - add, sub, Hadamard, scale, axpy, dot
//! - **Stable softmax** - `e^x = m · 2^n` decomposition with rescaled
//!   partial sums, plus log-sum-exp
//!
//! ## Quick Start
//!
//! ```rust
//! use strata_kernels::{matmul, softmax, MatMut, MatRef, SoftmaxAxis};
//!
//! let w = [0.5f32; 12];
//! let x = [1.0f32; 4];
//! let mut y = [0.0f32; 3];
//!
//! let w = MatRef::from_slice(&w, 3, 4).unwrap();
//! let x = MatRef::from_slice(&x, 4, 1).unwrap();
//! let mut out = MatMut::from_slice(&mut y, 3, 1).unwrap();
//! matmul(&w, &x, &mut out).unwrap();
//! assert_eq!(y, [2.0, 2.0, 2.0]);
//!
//! let logits = MatRef::from_slice(&y, 3, 1).unwrap();
//! let mut p = [0.0f32; 3];
//! let mut probs = MatMut::from_slice(&mut p, 3, 1).unwrap();
//! softmax(&logits, SoftmaxAxis::Columns, &mut probs).unwrap();
//! assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
//! ```

pub mod broadcast;
pub mod elementwise;
pub mod error;
pub mod matmul;
pub mod matrix;
pub mod softmax;
pub mod transpose;

#[cfg(test)]
mod property_tests;

pub use broadcast::{broadcast, reduce, BroadcastAxis};
pub use elementwise::{add, add_assign, axpy, dot, hadamard, map, scale, sub, zip_map};
pub use error::{KernelError, KernelResult};
pub use matmul::matmul;
pub use matrix::{MatMut, MatRef};
pub use softmax::{
    exp_parts, lane_exp_sum, log_sum_exp, softmax, softmax_slice, ExpParts, ExpSum, SoftmaxAxis,
};
pub use transpose::{transpose, transpose_tiled, TRANSPOSE_TILE};
