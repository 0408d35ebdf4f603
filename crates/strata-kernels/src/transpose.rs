//! Cache-tiled out-of-place transpose
//!
//! The source and destination are distinct borrows, so an in-place transpose
//! cannot be expressed. Tiles of `TRANSPOSE_TILE x TRANSPOSE_TILE` keep both
//! the rows read and the rows written resident in cache.

use crate::error::{KernelError, KernelResult};
use crate::matrix::{MatMut, MatRef};

/// Default tile edge length
pub const TRANSPOSE_TILE: usize = 32;

/// Write `srcᵀ` into `dst` using the default tile size
///
/// # Examples
///
/// ```
/// use strata_kernels::{transpose, MatMut, MatRef};
///
/// let src = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
/// let mut out = [0.0; 6];
/// let s = MatRef::from_slice(&src, 2, 3).unwrap();
/// let mut d = MatMut::from_slice(&mut out, 3, 2).unwrap();
/// transpose(&s, &mut d).unwrap();
/// assert_eq!(out, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
/// ```
pub fn transpose<T: Copy>(src: &MatRef<'_, T>, dst: &mut MatMut<'_, T>) -> KernelResult<()> {
    transpose_tiled(src, dst, TRANSPOSE_TILE)
}

/// Write `srcᵀ` into `dst`, walking `tile x tile` blocks
///
/// # Errors
///
/// Fails if `tile` is zero or `dst` is not `cols x rows` of `src`.
pub fn transpose_tiled<T: Copy>(
    src: &MatRef<'_, T>,
    dst: &mut MatMut<'_, T>,
    tile: usize,
) -> KernelResult<()> {
    if tile == 0 {
        return Err(KernelError::invalid_tile_size(
            "transpose",
            tile,
            "tiles must be non-empty",
        ));
    }
    if dst.rows() != src.cols() || dst.cols() != src.rows() {
        return Err(KernelError::dimension_mismatch(
            "transpose",
            vec![src.cols(), src.rows()],
            dst.dims(),
            "destination is the transposed shape",
        ));
    }

    let (rows, cols) = (src.rows(), src.cols());
    for row_block in (0..rows).step_by(tile) {
        let row_end = (row_block + tile).min(rows);
        for col_block in (0..cols).step_by(tile) {
            let col_end = (col_block + tile).min(cols);
            for i in row_block..row_end {
                for j in col_block..col_end {
                    dst.set(j, i, src.get(i, j));
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
    fn test_transpose_across_tile_edges() {
        let (rows, cols) = (37, 70);
        let src: Vec<f32> = (0..rows * cols).map(|v| v as f32).collect();
        let mut out = vec![0.0f32; rows * cols];

        let s = MatRef::from_slice(&src, rows, cols).unwrap();
        let mut d = MatMut::from_slice(&mut out, cols, rows).unwrap();
        transpose_tiled(&s, &mut d, 8).unwrap();

        for i in 0..rows {
            for j in 0..cols {
                assert_eq!(out[j * rows + i], src[i * cols + j]);
            }
        }
    }

    #[test]
    fn test_transpose_with_offsets() {
        let backing = [0.0, 1.0, 2.0, 3.0, 4.0];
        let mut out = [-1.0; 6];
        let s = MatRef::new(&backing, 1, 2, 2).unwrap();
        let mut d = MatMut::new(&mut out, 2, 2, 2).unwrap();
        transpose(&s, &mut d).unwrap();

        assert_eq!(out, [-1.0, -1.0, 1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_transpose_rejects_zero_tile() {
        let src = [1.0];
        let mut out = [0.0];
        let s = MatRef::from_slice(&src, 1, 1).unwrap();
        let mut d = MatMut::from_slice(&mut out, 1, 1).unwrap();

        let err = transpose_tiled(&s, &mut d, 0).unwrap_err();
        assert!(matches!(err, KernelError::InvalidTileSize { .. }));
    }

    #[test]
    fn test_transpose_rejects_wrong_destination() {
        let src = [1.0; 6];
        let mut out = [0.0; 6];
        let s = MatRef::from_slice(&src, 2, 3).unwrap();
        let mut d = MatMut::from_slice(&mut out, 2, 3).unwrap();

        assert!(transpose(&s, &mut d).is_err());
    }
}
