//! Error types for shape handling, pointer encoding and arena allocation
//!
//! Every variant here is a programmer or configuration error. Nothing is
//! retried: the caller is expected to abort the run and report the context
//! carried by the variant.

use crate::address::{RegionKind, TensorPointer};
use thiserror::Error;

/// Errors raised by the core shape, address and arena primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An allocation would overrun the pre-computed capacity of a region
    #[error(
        "arena capacity exceeded in {region} region: requested {requested} elements \
         with {used} of {capacity} already in use"
    )]
    CapacityExceeded {
        region: RegionKind,
        requested: usize,
        used: usize,
        capacity: usize,
    },

    /// The null pointer was dereferenced
    #[error("attempted to dereference the null tensor pointer")]
    NullPointer,

    /// A pointer refers to elements outside the allocated part of its region
    #[error("tensor pointer {pointer} is outside the {allocated} allocated elements of the {region} region")]
    InvalidPointer {
        pointer: TensorPointer,
        region: RegionKind,
        allocated: usize,
    },

    /// An offset or length does not fit into its pointer field
    #[error("pointer {field} {value} exceeds the encodable maximum {max}")]
    EncodingOverflow {
        field: &'static str,
        value: usize,
        max: usize,
    },

    /// A rank change would drop or invent information
    #[error("cannot change rank of shape {shape:?} to {rank}: {reason}")]
    InvalidRank {
        shape: Vec<usize>,
        rank: usize,
        reason: String,
    },
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Create an invalid rank error
    pub fn invalid_rank(shape: &[usize], rank: usize, reason: impl Into<String>) -> Self {
        CoreError::InvalidRank {
            shape: shape.to_vec(),
            rank,
            reason: reason.into(),
        }
    }

    /// Whether this error reports an exhausted arena region
    pub fn is_capacity_violation(&self) -> bool {
        matches!(self, CoreError::CapacityExceeded { .. })
    }
}
