//! Kernel error type
//!
//! Kernels never panic on bad dimensions. Every shape or bounds problem comes
//! back as a [`KernelError`] and the graph layer wraps it with node context.

use thiserror::Error;

/// Error type for kernel operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    /// An operand or output does not have the layout the kernel expects
    #[error("{kernel}: expected dims {expected:?}, got {actual:?} ({hint})")]
    DimensionMismatch {
        kernel: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
        hint: &'static str,
    },

    /// A view window runs past the end of its backing buffer
    #[error("{kernel}: window [{offset}, +{len}) exceeds a backing buffer of {available} elements")]
    OutOfBounds {
        kernel: &'static str,
        offset: usize,
        len: usize,
        available: usize,
    },

    /// Tile edge of zero
    #[error("{kernel}: tile size {tile_size} rejected ({hint})")]
    InvalidTileSize {
        kernel: &'static str,
        tile_size: usize,
        hint: &'static str,
    },

    /// Two operands that cannot be combined
    #[error("{kernel}: cannot combine {left:?} with {right:?} ({hint})")]
    IncompatibleShapes {
        kernel: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
        hint: &'static str,
    },
}

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    pub fn dimension_mismatch(
        kernel: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
        hint: &'static str,
    ) -> Self {
        KernelError::DimensionMismatch {
            kernel,
            expected,
            actual,
            hint,
        }
    }

    pub fn out_of_bounds(
        kernel: &'static str,
        offset: usize,
        len: usize,
        available: usize,
    ) -> Self {
        KernelError::OutOfBounds {
            kernel,
            offset,
            len,
            available,
        }
    }

    pub fn invalid_tile_size(kernel: &'static str, tile_size: usize, hint: &'static str) -> Self {
        KernelError::InvalidTileSize {
            kernel,
            tile_size,
            hint,
        }
    }

    pub fn incompatible_shapes(
        kernel: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
        hint: &'static str,
    ) -> Self {
        KernelError::IncompatibleShapes {
            kernel,
            left,
            right,
            hint,
        }
    }

    /// Name of the kernel that rejected its arguments
    pub fn kernel(&self) -> &'static str {
        match self {
            KernelError::DimensionMismatch { kernel, .. }
            | KernelError::OutOfBounds { kernel, .. }
            | KernelError::InvalidTileSize { kernel, .. }
            | KernelError::IncompatibleShapes { kernel, .. } => kernel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_kernel() {
        let err = KernelError::dimension_mismatch(
            "matmul",
            vec![3, 2],
            vec![3, 4],
            "output is m x n",
        );
        let msg = err.to_string();
        assert!(msg.starts_with("matmul:"));
        assert!(msg.contains("[3, 2]") && msg.contains("[3, 4]"));
        assert_eq!(err.kernel(), "matmul");
    }

    #[test]
    fn test_window_message() {
        let msg = KernelError::out_of_bounds("MatRef::new", 10, 12, 16).to_string();
        assert!(msg.contains("[10, +12)"));
        assert!(msg.contains("16 elements"));
    }

    #[test]
    fn test_usable_as_dyn_error() {
        let err = KernelError::invalid_tile_size("transpose", 0, "tiles must be non-empty");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
        assert!(boxed.to_string().contains("tile size 0"));
    }
}
