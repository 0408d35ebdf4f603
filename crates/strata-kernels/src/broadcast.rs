//! Vector broadcast and its adjoint reduction
//!
//! [`broadcast`] replicates a vector across one axis of a matrix and
//! [`reduce`] sums along the same axis. The pair is an exact adjoint:
//! for any `v` and `G`, `<broadcast(v), G> == <v, reduce(G)>`, which is what
//! makes `reduce` the correct gradient of `broadcast`.

use crate::error::{KernelError, KernelResult};
use crate::matrix::{MatMut, MatRef};
use scirs2_core::numeric::Float;
use std::fmt;

/// Axis along which a vector is replicated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastAxis {
    /// A length-`rows` column vector is copied into every column:
    /// `out[i][j] = v[i]`
    Columns,
    /// A length-`cols` row vector is copied into every row:
    /// `out[i][j] = v[j]`
    Rows,
}

impl BroadcastAxis {
    /// Vector length required for a `rows x cols` target
    pub fn vector_len(self, rows: usize, cols: usize) -> usize {
        match self {
            BroadcastAxis::Columns => rows,
            BroadcastAxis::Rows => cols,
        }
    }
}

impl fmt::Display for BroadcastAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastAxis::Columns => f.write_str("columns"),
            BroadcastAxis::Rows => f.write_str("rows"),
        }
    }
}

/// Replicate `v` along `axis` into `out`
///
/// # Examples
///
/// ```
/// use strata_kernels::{broadcast, BroadcastAxis, MatMut};
///
/// let mut out = [0.0; 6];
/// let mut m = MatMut::from_slice(&mut out, 2, 3).unwrap();
/// broadcast(&[1.0, 2.0], BroadcastAxis::Columns, &mut m).unwrap();
/// assert_eq!(out, [1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
/// ```
pub fn broadcast<T: Copy>(
    v: &[T],
    axis: BroadcastAxis,
    out: &mut MatMut<'_, T>,
) -> KernelResult<()> {
    let expected = axis.vector_len(out.rows(), out.cols());
    if v.len() != expected {
        return Err(KernelError::dimension_mismatch(
            "broadcast",
            vec![expected],
            vec![v.len()],
            "vector length is the target rows (columns axis) or cols (rows axis)",
        ));
    }

    for i in 0..out.rows() {
        let row = out.row_mut(i);
        match axis {
            BroadcastAxis::Columns => row.fill(v[i]),
            BroadcastAxis::Rows => row.copy_from_slice(v),
        }
    }

    Ok(())
}

/// Sum `src` along `axis` into `out`, the adjoint of [`broadcast`]
///
/// # Examples
///
/// ```
/// use strata_kernels::{reduce, BroadcastAxis, MatRef};
///
/// let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
/// let m = MatRef::from_slice(&data, 2, 3).unwrap();
/// let mut sums = [0.0; 2];
/// reduce(&m, BroadcastAxis::Columns, &mut sums).unwrap();
/// assert_eq!(sums, [6.0, 15.0]);
/// ```
pub fn reduce<T: Float>(
    src: &MatRef<'_, T>,
    axis: BroadcastAxis,
    out: &mut [T],
) -> KernelResult<()> {
    let expected = axis.vector_len(src.rows(), src.cols());
    if out.len() != expected {
        return Err(KernelError::dimension_mismatch(
            "reduce",
            vec![expected],
            vec![out.len()],
            "output length is the source rows (columns axis) or cols (rows axis)",
        ));
    }

    out.fill(T::zero());
    for i in 0..src.rows() {
        let row = src.row(i);
        match axis {
            BroadcastAxis::Columns => {
                out[i] = row.iter().fold(T::zero(), |acc, &x| acc + x);
            }
            BroadcastAxis::Rows => {
                for (acc, &x) in out.iter_mut().zip(row) {
                    *acc = *acc + x;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_rows() {
        let mut out = [0.0; 6];
        let mut m = MatMut::from_slice(&mut out, 3, 2).unwrap();
        broadcast(&[7.0, 8.0], BroadcastAxis::Rows, &mut m).unwrap();
        assert_eq!(out, [7.0, 8.0, 7.0, 8.0, 7.0, 8.0]);
    }

    #[test]
    fn test_reduce_rows() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let m = MatRef::from_slice(&data, 3, 2).unwrap();
        let mut sums = [99.0; 2];
        reduce(&m, BroadcastAxis::Rows, &mut sums).unwrap();
        assert_eq!(sums, [9.0, 12.0]);
    }

    #[test]
    fn test_broadcast_rejects_wrong_length() {
        let mut out = [0.0; 6];
        let mut m = MatMut::from_slice(&mut out, 2, 3).unwrap();
        let err = broadcast(&[1.0, 2.0, 3.0], BroadcastAxis::Columns, &mut m).unwrap_err();
        assert!(err.to_string().contains("columns"));
    }

    #[test]
    fn test_reduce_rejects_wrong_length() {
        let data = [1.0f32; 6];
        let m = MatRef::from_slice(&data, 2, 3).unwrap();
        let mut sums = [0.0f32; 2];
        assert!(reduce(&m, BroadcastAxis::Rows, &mut sums).is_err());
    }
}
