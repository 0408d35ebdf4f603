//! Elementwise kernels on contiguous slices
//!
//! All operands must have the same length. The arena hands out contiguous
//! tensors, so these kernels take already-resolved slices rather than views.

use crate::error::{KernelError, KernelResult};
use scirs2_core::numeric::Float;

#[inline]
fn check_len(operation: &'static str, expected: usize, actual: usize) -> KernelResult<()> {
    if expected != actual {
        return Err(KernelError::dimension_mismatch(
            operation,
            vec![expected],
            vec![actual],
            "operands have equal length",
        ));
    }
    Ok(())
}

/// `out[i] = f(a[i])`
pub fn map<T: Copy>(a: &[T], out: &mut [T], f: impl Fn(T) -> T) -> KernelResult<()> {
    check_len("map", a.len(), out.len())?;
    for (o, &x) in out.iter_mut().zip(a) {
        *o = f(x);
    }
    Ok(())
}

/// `out[i] = f(a[i], b[i])`
pub fn zip_map<T: Copy>(
    a: &[T],
    b: &[T],
    out: &mut [T],
    f: impl Fn(T, T) -> T,
) -> KernelResult<()> {
    check_len("zip_map", a.len(), b.len())?;
    check_len("zip_map", a.len(), out.len())?;
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = f(x, y);
    }
    Ok(())
}

/// `out = a + b`
pub fn add<T: Float>(a: &[T], b: &[T], out: &mut [T]) -> KernelResult<()> {
    zip_map(a, b, out, |x, y| x + y)
}

/// `out = a - b`
pub fn sub<T: Float>(a: &[T], b: &[T], out: &mut [T]) -> KernelResult<()> {
    zip_map(a, b, out, |x, y| x - y)
}

/// Hadamard product, `out = a ⊙ b`
///
/// # Examples
///
/// ```
/// use strata_kernels::hadamard;
///
/// let mut out = [0.0; 3];
/// hadamard(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0], &mut out).unwrap();
/// assert_eq!(out, [4.0, 10.0, 18.0]);
/// ```
pub fn hadamard<T: Float>(a: &[T], b: &[T], out: &mut [T]) -> KernelResult<()> {
    zip_map(a, b, out, |x, y| x * y)
}

/// `out = alpha * a`
pub fn scale<T: Float>(a: &[T], alpha: T, out: &mut [T]) -> KernelResult<()> {
    map(a, out, |x| alpha * x)
}

/// `dst += src`
pub fn add_assign<T: Float>(dst: &mut [T], src: &[T]) -> KernelResult<()> {
    axpy(T::one(), src, dst)
}

/// `y += alpha * x`
pub fn axpy<T: Float>(alpha: T, x: &[T], y: &mut [T]) -> KernelResult<()> {
    check_len("axpy", x.len(), y.len())?;
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi = *yi + alpha * xi;
    }
    Ok(())
}

/// Inner product `Σ a[i] * b[i]`
pub fn dot<T: Float>(a: &[T], b: &[T]) -> KernelResult<T> {
    check_len("dot", a.len(), b.len())?;
    Ok(a.iter().zip(b).fold(T::zero(), |acc, (&x, &y)| acc + x * y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_sub() {
        let mut out = [0.0; 2];
        add(&[1.0, 2.0], &[3.0, 4.0], &mut out).unwrap();
        assert_eq!(out, [4.0, 6.0]);
        sub(&[1.0, 2.0], &[3.0, 5.0], &mut out).unwrap();
        assert_eq!(out, [-2.0, -3.0]);
    }

    #[test]
    fn test_axpy_and_add_assign() {
        let mut y = [1.0f32, 1.0, 1.0];
        axpy(2.0, &[1.0, 2.0, 3.0], &mut y).unwrap();
        assert_eq!(y, [3.0, 5.0, 7.0]);
        add_assign(&mut y, &[1.0, 1.0, 1.0]).unwrap();
        assert_eq!(y, [4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_scale_and_dot() {
        let mut out = [0.0; 3];
        scale(&[1.0, -2.0, 0.5], 4.0, &mut out).unwrap();
        assert_eq!(out, [4.0, -8.0, 2.0]);
        assert_eq!(dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap(), 32.0);
    }

    #[test]
    fn test_length_mismatch() {
        let mut out = [0.0f64; 2];
        let err = hadamard(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], &mut out).unwrap_err();
        assert!(matches!(err, KernelError::DimensionMismatch { .. }));
        assert!(dot(&[1.0f64], &[1.0, 2.0]).is_err());
    }
}
