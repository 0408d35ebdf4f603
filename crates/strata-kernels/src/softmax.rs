//! Numerically stable softmax and log-sum-exp
//!
//! Every exponential is evaluated as `e^x = m · 2^n` with
//! `n = round(x · log₂e)` and `m = e^t`, `t = x − n·ln2 ∈ [−ln2/2, ln2/2]`.
//! The mantissa `m` is always well conditioned, so it is computed with a
//! short polynomial, and the integer exponent is tracked separately.
//!
//! A lane (one row or one column) is summed with [`ExpSum`], which keeps the
//! running sum relative to the largest exponent seen so far and rescales it by
//! an exact power of two whenever a larger exponent arrives. Nothing
//! overflows even for inputs in the hundreds, and the normalised output
//! `m_i · 2^(n_i − N) / Σ` never leaves `[0, 1]`.
//!
//! Inputs are expected to be finite. NaN propagates to the whole lane.
//!
//! # Examples
//!
//! ```
//! use strata_kernels::softmax_slice;
//!
//! let x = [1000.0f32, 1000.0, -1000.0];
//! let mut p = [0.0f32; 3];
//! softmax_slice(&x, &mut p).unwrap();
//! assert!((p[0] - 0.5).abs() < 1e-6);
//! assert_eq!(p[2], 0.0);
//! ```

use crate::error::{KernelError, KernelResult};
use crate::matrix::{MatMut, MatRef};
use std::f32::consts::{LN_2, LOG2_E};
use std::fmt;

/// High part of ln2; exact in 9 bits so `n · LN2_HI` is exact for |n| < 2^15
const LN2_HI: f32 = 0.693_359_375;
/// `ln2 − LN2_HI`
const LN2_LO: f32 = -2.121_944_4e-4;

/// Taylor coefficients of `e^t`, highest degree first
const EXP_COEFFS: [f32; 8] = [
    1.0 / 5040.0,
    1.0 / 720.0,
    1.0 / 120.0,
    1.0 / 24.0,
    1.0 / 6.0,
    0.5,
    1.0,
    1.0,
];

/// Smallest exponent with a normal power of two
const MIN_NORMAL_EXP: i32 = -126;
/// Largest finite power-of-two exponent
const MAX_EXP: i32 = 127;

/// Axis whose lanes are normalised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftmaxAxis {
    /// Each column is a distribution (sum over rows)
    Columns,
    /// Each row is a distribution (sum over columns)
    Rows,
}

impl SoftmaxAxis {
    /// `(lane count, lane length)` for a `rows x cols` matrix
    pub fn lanes(self, rows: usize, cols: usize) -> (usize, usize) {
        match self {
            SoftmaxAxis::Columns => (cols, rows),
            SoftmaxAxis::Rows => (rows, cols),
        }
    }

    /// Matrix coordinate of element `k` of lane `lane`
    #[inline]
    pub fn coord(self, lane: usize, k: usize) -> (usize, usize) {
        match self {
            SoftmaxAxis::Columns => (k, lane),
            SoftmaxAxis::Rows => (lane, k),
        }
    }
}

impl fmt::Display for SoftmaxAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SoftmaxAxis::Columns => f.write_str("columns"),
            SoftmaxAxis::Rows => f.write_str("rows"),
        }
    }
}

/// `e^x` split into `mantissa · 2^exponent`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpParts {
    /// `e^t` with `|t| <= ln2/2` (up to rounding)
    pub mantissa: f32,
    /// `round(x · log₂e)`
    pub exponent: i32,
}

impl ExpParts {
    /// Recombine into `e^x`; overflows to infinity or underflows to zero
    pub fn value(self) -> f32 {
        scale_by_pow2(self.mantissa, self.exponent)
    }
}

/// Decompose `e^x`
pub fn exp_parts(x: f32) -> ExpParts {
    let n = (x * LOG2_E).round();
    let t = (x - n * LN2_HI) - n * LN2_LO;
    let mantissa = EXP_COEFFS.iter().fold(0.0f32, |acc, &c| acc * t + c);
    ExpParts {
        mantissa,
        exponent: n as i32,
    }
}

#[inline]
fn pow2(exponent: i32) -> f32 {
    f32::from_bits(((exponent + 127) as u32) << 23)
}

/// `value · 2^exponent` without forming an out-of-range power of two
fn scale_by_pow2(value: f32, exponent: i32) -> f32 {
    if exponent < MIN_NORMAL_EXP {
        // Two steps so subnormal results are still produced
        let rest = exponent - MIN_NORMAL_EXP;
        if rest < MIN_NORMAL_EXP {
            return value * 0.0;
        }
        value * pow2(MIN_NORMAL_EXP) * pow2(rest)
    } else if exponent > MAX_EXP {
        let rest = (exponent - MAX_EXP).min(MAX_EXP);
        value * pow2(MAX_EXP) * pow2(rest)
    } else {
        value * pow2(exponent)
    }
}

/// Running `Σ e^x` stored as `sum · 2^max_exponent`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExpSum {
    sum: f32,
    max_exponent: Option<i32>,
}

impl ExpSum {
    /// Empty sum
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate `e^x`
    pub fn push(&mut self, x: f32) {
        self.push_parts(exp_parts(x));
    }

    fn push_parts(&mut self, parts: ExpParts) {
        match self.max_exponent {
            Some(max) if parts.exponent <= max => {
                self.sum += scale_by_pow2(parts.mantissa, parts.exponent.saturating_sub(max));
            }
            Some(max) => {
                let shift = max.saturating_sub(parts.exponent);
                self.sum = scale_by_pow2(self.sum, shift) + parts.mantissa;
                self.max_exponent = Some(parts.exponent);
            }
            None => {
                self.sum = parts.mantissa;
                self.max_exponent = Some(parts.exponent);
            }
        }
    }

    /// Combine with a partial sum over another part of the lane
    pub fn merge(&mut self, other: ExpSum) {
        if let Some(exponent) = other.max_exponent {
            self.push_parts(ExpParts {
                mantissa: other.sum,
                exponent,
            });
        }
    }

    /// Largest exponent seen, `None` for an empty sum
    pub fn max_exponent(&self) -> Option<i32> {
        self.max_exponent
    }

    /// `ln Σ e^x`, negative infinity for an empty sum
    pub fn ln(&self) -> f32 {
        match self.max_exponent {
            None => f32::NEG_INFINITY,
            Some(n) => n as f32 * LN_2 + self.sum.ln(),
        }
    }

    /// `e^x / Σ e^x`
    #[inline]
    pub fn weight(&self, x: f32) -> f32 {
        let max = self.max_exponent.unwrap_or(0);
        let parts = exp_parts(x);
        scale_by_pow2(parts.mantissa, parts.exponent.saturating_sub(max)) / self.sum
    }
}

impl FromIterator<f32> for ExpSum {
    fn from_iter<I: IntoIterator<Item = f32>>(iter: I) -> Self {
        let mut acc = ExpSum::new();
        for x in iter {
            acc.push(x);
        }
        acc
    }
}

/// Stable softmax of a single contiguous lane
pub fn softmax_slice(x: &[f32], out: &mut [f32]) -> KernelResult<()> {
    if x.len() != out.len() {
        return Err(KernelError::dimension_mismatch(
            "softmax",
            vec![x.len()],
            vec![out.len()],
            "output matches the input lane",
        ));
    }

    let acc: ExpSum = x.iter().copied().collect();
    for (o, &v) in out.iter_mut().zip(x) {
        *o = acc.weight(v);
    }
    Ok(())
}

/// Accumulated exponential sum of one lane of `src`
pub fn lane_exp_sum(src: &MatRef<'_, f32>, axis: SoftmaxAxis, lane: usize) -> ExpSum {
    let (_, len) = axis.lanes(src.rows(), src.cols());
    (0..len)
        .map(|k| {
            let (i, j) = axis.coord(lane, k);
            src.get(i, j)
        })
        .collect()
}

/// Stable softmax of every lane of `src` along `axis`
///
/// # Arguments
///
/// * `src` - Input logits with shape (rows, cols)
/// * `axis` - [`SoftmaxAxis::Columns`] normalises each column,
///   [`SoftmaxAxis::Rows`] each row
/// * `dst` - Output with the same shape as `src`
///
/// # Complexity
///
/// Time: O(rows * cols), two passes per lane
/// Space: O(1) beyond the output
pub fn softmax(
    src: &MatRef<'_, f32>,
    axis: SoftmaxAxis,
    dst: &mut MatMut<'_, f32>,
) -> KernelResult<()> {
    if src.rows() != dst.rows() || src.cols() != dst.cols() {
        return Err(KernelError::dimension_mismatch(
            "softmax",
            src.dims(),
            dst.dims(),
            "output matches the input shape",
        ));
    }

    let (lanes, len) = axis.lanes(src.rows(), src.cols());
    for lane in 0..lanes {
        let acc = lane_exp_sum(src, axis, lane);
        for k in 0..len {
            let (i, j) = axis.coord(lane, k);
            dst.set(i, j, acc.weight(src.get(i, j)));
        }
    }

    Ok(())
}

/// `ln Σ e^x` of every lane of `src` along `axis`
pub fn log_sum_exp(src: &MatRef<'_, f32>, axis: SoftmaxAxis, out: &mut [f32]) -> KernelResult<()> {
    let (lanes, _) = axis.lanes(src.rows(), src.cols());
    if out.len() != lanes {
        return Err(KernelError::dimension_mismatch(
            "log_sum_exp",
            vec![lanes],
            vec![out.len()],
            "one output per lane",
        ));
    }

    for (lane, o) in out.iter_mut().enumerate() {
        *o = lane_exp_sum(src, axis, lane).ln();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_softmax(x: &[f32]) -> Vec<f64> {
        let exps: Vec<f64> = x.iter().map(|&v| (v as f64).exp()).collect();
        let sum: f64 = exps.iter().sum();
        exps.iter().map(|e| e / sum).collect()
    }

    #[test]
    fn test_exp_parts_matches_exp() {
        for &x in &[-20.0f32, -1.5, -0.1, 0.0, 0.3, 1.0, 10.0, 80.0] {
            let parts = exp_parts(x);
            let expected = (x as f64).exp();
            let rel = ((parts.value() as f64 - expected) / expected).abs();
            assert!(rel < 1e-6, "x = {}: relative error {}", x, rel);
            assert!(parts.mantissa > 0.70 && parts.mantissa < 1.42);
        }
    }

    #[test]
    fn test_exp_parts_overflow_and_underflow() {
        assert_eq!(exp_parts(200.0).value(), f32::INFINITY);
        assert_eq!(exp_parts(-200.0).value(), 0.0);
        // Still representable as a decomposition
        assert_eq!(exp_parts(200.0).exponent, 289);
    }

    #[test]
    fn test_softmax_slice_extreme_values() {
        let x = [60.0f32, -70.0, 0.0, 3.5, 100.0, -55.0, 99.0, 1.0];
        let mut out = [0.0f32; 8];
        softmax_slice(&x, &mut out).unwrap();

        let reference = naive_softmax(&x);
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        for (o, r) in out.iter().zip(&reference) {
            assert!((*o as f64 - r).abs() < 1e-4);
        }
    }

    #[test]
    fn test_log_sum_exp_large_inputs() {
        let data = [500.0f32, 500.0, 10.0, -3.0];
        let m = MatRef::from_slice(&data, 2, 2).unwrap();
        let mut out = [0.0f32; 2];
        log_sum_exp(&m, SoftmaxAxis::Columns, &mut out).unwrap();

        // Column 0: ln(e^500 + e^10) ~ 500; column 1: ln(e^500 + e^-3) ~ 500
        assert!((out[0] - 500.0).abs() < 1e-3);
        assert!((out[1] - 500.0).abs() < 1e-3);

        let mut rows = [0.0f32; 2];
        log_sum_exp(&m, SoftmaxAxis::Rows, &mut rows).unwrap();
        assert!((rows[0] - (500.0 + 2.0f32.ln())).abs() < 1e-3);
        let expected = ((10.0f64).exp() + (-3.0f64).exp()).ln() as f32;
        assert!((rows[1] - expected).abs() < 1e-4);
    }

    #[test]
    fn test_softmax_columns() {
        // 3 x 2, each column is a distribution
        let data = [1.0f32, -1.0, 2.0, -1.0, 3.0, -1.0];
        let m = MatRef::from_slice(&data, 3, 2).unwrap();
        let mut out = [0.0f32; 6];
        let mut d = MatMut::from_slice(&mut out, 3, 2).unwrap();
        softmax(&m, SoftmaxAxis::Columns, &mut d).unwrap();

        let col0 = naive_softmax(&[1.0, 2.0, 3.0]);
        for (k, r) in col0.iter().enumerate() {
            assert!((out[k * 2] as f64 - r).abs() < 1e-6);
            assert!((out[k * 2 + 1] - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_merge_equals_single_pass() {
        let x = [3.0f32, 90.0, -40.0, 12.0, 0.5, 70.0];
        let whole: ExpSum = x.iter().copied().collect();

        let mut left: ExpSum = x[..3].iter().copied().collect();
        let right: ExpSum = x[3..].iter().copied().collect();
        left.merge(right);

        assert!((left.ln() - whole.ln()).abs() < 1e-4);
        assert_eq!(left.max_exponent(), whole.max_exponent());
        assert_eq!(ExpSum::new().ln(), f32::NEG_INFINITY);
    }

    #[test]
    fn test_nan_propagates() {
        let mut out = [0.0f32; 3];
        softmax_slice(&[1.0, f32::NAN, 2.0], &mut out).unwrap();
        assert!(out.iter().all(|v| v.is_nan()));
    }
}
