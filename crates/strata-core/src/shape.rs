//! Shape utilities shared by the kernels and the graph.
//!
//! The engine works on row-major matrices. Vectors are column vectors
//! (`[n]` is treated as `n x 1`) and scalars are `1 x 1`. Higher ranks are
//! only handled by the rank helpers so that shapes can be normalised before
//! they reach an operator.
//!
//! # Examples
//!
//! ```
//! use strata_core::shape::{broadcast_to_rank, cut_to_rank, stride};
//! use strata_core::shape;
//!
//! let s = shape![3, 4];
//! assert_eq!(stride(&s), 12);
//!
//! let wide = broadcast_to_rank(&s, 4).unwrap();
//! assert_eq!(wide.as_slice(), &[1, 1, 3, 4]);
//! assert_eq!(cut_to_rank(&wide, 2).unwrap(), s);
//! ```

use crate::error::{CoreError, CoreResult};
use smallvec::SmallVec;

/// Shape type using SmallVec to avoid heap allocation for common cases.
///
/// Four inline extents cover every shape the graph produces.
pub type Shape = SmallVec<[usize; 4]>;

/// Build a [`Shape`] from a list of extents.
#[macro_export]
macro_rules! shape {
    ($($dim:expr),* $(,)?) => {
        $crate::shape::Shape::from_slice(&[$($dim),*])
    };
}

/// Number of elements covered by a shape (the product of its extents).
///
/// The empty shape describes a scalar and has stride 1.
pub fn stride(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Prepend unit extents until `shape` has exactly `rank` dimensions.
pub fn broadcast_to_rank(shape: &[usize], rank: usize) -> CoreResult<Shape> {
    if rank < shape.len() {
        return Err(CoreError::invalid_rank(
            shape,
            rank,
            "broadcasting cannot reduce rank",
        ));
    }

    let mut result = Shape::with_capacity(rank);
    result.extend(std::iter::repeat_n(1, rank - shape.len()));
    result.extend_from_slice(shape);
    Ok(result)
}

/// Strip leading unit extents until `shape` has exactly `rank` dimensions.
///
/// Fails if a non-unit extent would have to be removed.
pub fn cut_to_rank(shape: &[usize], rank: usize) -> CoreResult<Shape> {
    if rank > shape.len() {
        return Err(CoreError::invalid_rank(
            shape,
            rank,
            "cutting cannot increase rank",
        ));
    }

    let excess = shape.len() - rank;
    if let Some(&extent) = shape[..excess].iter().find(|&&d| d != 1) {
        return Err(CoreError::invalid_rank(
            shape,
            rank,
            format!("leading extent {} is not 1", extent),
        ));
    }

    Ok(Shape::from_slice(&shape[excess..]))
}

/// Interpret a shape as `(rows, cols)`.
///
/// Rank 0 is `1 x 1`, rank 1 is a column vector, rank 2 is taken as is.
/// Higher ranks are accepted when their leading extents are all 1.
pub fn matrix_dims(shape: &[usize]) -> CoreResult<(usize, usize)> {
    match shape.len() {
        0 => Ok((1, 1)),
        1 => Ok((shape[0], 1)),
        2 => Ok((shape[0], shape[1])),
        _ => {
            let cut = cut_to_rank(shape, 2)?;
            Ok((cut[0], cut[1]))
        }
    }
}

/// Shape of the transpose of a matrix-like shape.
pub fn transposed(shape: &[usize]) -> CoreResult<Shape> {
    let (rows, cols) = matrix_dims(shape)?;
    Ok(crate::shape![cols, rows])
}
