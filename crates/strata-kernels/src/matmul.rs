//! Dense matrix multiplication on offset views
//!
//! `C[m, n] = A[m, k] · B[k, n]` in row-major layout. The loop order is
//! `i, p, j` so the innermost loop streams a row of `B` and a row of `C`
//! contiguously.

use crate::error::{KernelError, KernelResult};
use crate::matrix::{MatMut, MatRef};
use scirs2_core::numeric::Float;

/// Compute `C = A · B`, overwriting `C`
///
/// # Arguments
///
/// * `a` - Left operand with shape (m, k)
/// * `b` - Right operand with shape (k, n)
/// * `c` - Output with shape (m, n); previous contents are discarded
///
/// # Errors
///
/// Returns [`KernelError::IncompatibleShapes`] when the inner dimensions differ
/// and [`KernelError::DimensionMismatch`] when `c` is not `m x n`.
///
/// # Complexity
///
/// Time: O(m * k * n)
/// Space: O(1) beyond the output
///
/// # Examples
///
/// ```
/// use strata_kernels::{matmul, MatMut, MatRef};
///
/// // Both operands live in one backing buffer
/// let backing = [9.0, 1.0, 2.0, 3.0, 4.0, 1.0, 1.0];
/// let a = MatRef::new(&backing, 1, 2, 2).unwrap();
/// let b = MatRef::new(&backing, 5, 2, 1).unwrap();
///
/// let mut out = [0.0; 2];
/// let mut c = MatMut::from_slice(&mut out, 2, 1).unwrap();
/// matmul(&a, &b, &mut c).unwrap();
/// assert_eq!(out, [3.0, 7.0]);
/// ```
pub fn matmul<T: Float>(
    a: &MatRef<'_, T>,
    b: &MatRef<'_, T>,
    c: &mut MatMut<'_, T>,
) -> KernelResult<()> {
    if a.cols() != b.rows() {
        return Err(KernelError::incompatible_shapes(
            "matmul",
            a.dims(),
            b.dims(),
            "inner dimensions agree",
        ));
    }
    if c.rows() != a.rows() || c.cols() != b.cols() {
        return Err(KernelError::dimension_mismatch(
            "matmul",
            vec![a.rows(), b.cols()],
            c.dims(),
            "output is m x n",
        ));
    }

    let zero = T::zero();
    for i in 0..a.rows() {
        let a_row = a.row(i);
        let c_row = c.row_mut(i);
        c_row.fill(zero);
        for (p, &a_ip) in a_row.iter().enumerate() {
            for (c_ij, &b_pj) in c_row.iter_mut().zip(b.row(p)) {
                *c_ij = *c_ij + a_ip * b_pj;
            }
        }
    }

    Ok(())
}
