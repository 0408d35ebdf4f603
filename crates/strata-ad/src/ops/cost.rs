//! Cost nodes: cross-entropy, mean squared error and the fused
//! softmax/cross-entropy composite
//!
//! Costs reduce a `[rows, cols]` prediction and an equally shaped target to
//! a `[1, 1]` loss summed over the batch. When the operands are
//! batch-shaped (their columns are samples), columns at or beyond the actual
//! batch size are padding and contribute neither loss nor gradient. Costs
//! over parameters or constants always use every column.
//!
//! As the terminal node in [`CostMode::Training`] a cost skips the scalar
//! and returns the null pointer. Its gradients are generated from the
//! forward values alone, so no upstream seed is needed. When a cost feeds
//! another node the upstream scalar scales every gradient.

use crate::node::{mat, CostMode, OpContext, Operation, Sides};
use crate::source::MiniBatch;
use anyhow::Result;
use strata_core::{shape, Shape, TensorPointer};
use strata_kernels::{lane_exp_sum, softmax, MatMut, SoftmaxAxis};

/// Leading columns that hold real samples
fn live_columns(batch_shaped: bool, batch: &MiniBatch, cols: usize) -> usize {
    if batch_shaped {
        batch.valid_columns(cols)
    } else {
        cols
    }
}

#[inline]
fn is_valid(idx: usize, cols: usize, valid: usize) -> bool {
    idx % cols < valid
}

fn per_side(shape: &Shape, sides: Sides) -> Vec<Shape> {
    [sides.left, sides.right]
        .into_iter()
        .filter(|&side| side)
        .map(|_| shape.clone())
        .collect()
}

/// `L = -Σ t · ln p`
///
/// Probabilities are clamped to the smallest positive normal `f32` before
/// the logarithm.
pub struct CrossEntropyNode {
    input_shape: Shape,
    shape: Shape,
    batch_shaped: bool,
}

impl CrossEntropyNode {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            input_shape: shape![rows, cols],
            shape: shape![1, 1],
            batch_shaped: false,
        }
    }

    /// Mask padding columns of partial batches
    pub fn batch_shaped(mut self, batch_shaped: bool) -> Self {
        self.batch_shaped = batch_shaped;
        self
    }

    fn cols(&self) -> usize {
        self.input_shape[1]
    }
}

impl Operation for CrossEntropyNode {
    fn name(&self) -> &'static str {
        "cross_entropy"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        if ctx.mode == CostMode::Training {
            return Ok(TensorPointer::NULL);
        }
        let (p, t) = (ctx.left, ctx.right);
        let cols = self.cols();
        let valid = live_columns(self.batch_shaped, &ctx.batch, cols);
        ctx.produce(&self.shape, |view, dst| {
            let (p, t) = (view.slice(p)?, view.slice(t)?);
            dst[0] = p
                .iter()
                .zip(t)
                .enumerate()
                .filter(|&(idx, (_, &t))| t != 0.0 && is_valid(idx, cols, valid))
                .map(|(_, (&p, &t))| -t * p.max(f32::MIN_POSITIVE).ln())
                .sum();
            Ok(())
        })
    }

    fn left_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let scale = ctx.upstream_scale()?;
        let (p, t) = (ctx.left, ctx.right);
        let cols = self.cols();
        let valid = live_columns(self.batch_shaped, &ctx.batch, cols);
        ctx.produce(&self.input_shape, |view, dst| {
            let (p, t) = (view.slice(p)?, view.slice(t)?);
            for (idx, d) in dst.iter_mut().enumerate() {
                *d = if is_valid(idx, cols, valid) {
                    -scale * t[idx] / p[idx].max(f32::MIN_POSITIVE)
                } else {
                    0.0
                };
            }
            Ok(())
        })
    }

    fn right_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let scale = ctx.upstream_scale()?;
        let p = ctx.left;
        let cols = self.cols();
        let valid = live_columns(self.batch_shaped, &ctx.batch, cols);
        ctx.produce(&self.input_shape, |view, dst| {
            let p = view.slice(p)?;
            for (idx, d) in dst.iter_mut().enumerate() {
                *d = if is_valid(idx, cols, valid) {
                    -scale * p[idx].max(f32::MIN_POSITIVE).ln()
                } else {
                    0.0
                };
            }
            Ok(())
        })
    }

    fn backward_memory(&self, sides: Sides) -> Vec<Shape> {
        per_side(&self.input_shape, sides)
    }

    fn is_cost(&self) -> bool {
        true
    }
}

/// `L = ½ Σ (p - t)²`
pub struct MeanSquaredErrorNode {
    input_shape: Shape,
    shape: Shape,
    batch_shaped: bool,
}

impl MeanSquaredErrorNode {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            input_shape: shape![rows, cols],
            shape: shape![1, 1],
            batch_shaped: false,
        }
    }

    /// Mask padding columns of partial batches
    pub fn batch_shaped(mut self, batch_shaped: bool) -> Self {
        self.batch_shaped = batch_shaped;
        self
    }

    fn residual(&self, ctx: &mut OpContext<'_>, sign: f32) -> Result<TensorPointer> {
        let scale = sign * ctx.upstream_scale()?;
        let (p, t) = (ctx.left, ctx.right);
        let cols = self.input_shape[1];
        let valid = live_columns(self.batch_shaped, &ctx.batch, cols);
        ctx.produce(&self.input_shape, |view, dst| {
            let (p, t) = (view.slice(p)?, view.slice(t)?);
            for (idx, d) in dst.iter_mut().enumerate() {
                *d = if is_valid(idx, cols, valid) {
                    scale * (p[idx] - t[idx])
                } else {
                    0.0
                };
            }
            Ok(())
        })
    }
}

impl Operation for MeanSquaredErrorNode {
    fn name(&self) -> &'static str {
        "mean_squared_error"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        if ctx.mode == CostMode::Training {
            return Ok(TensorPointer::NULL);
        }
        let (p, t) = (ctx.left, ctx.right);
        let cols = self.input_shape[1];
        let valid = live_columns(self.batch_shaped, &ctx.batch, cols);
        ctx.produce(&self.shape, |view, dst| {
            let (p, t) = (view.slice(p)?, view.slice(t)?);
            let sum: f32 = p
                .iter()
                .zip(t)
                .enumerate()
                .filter(|&(idx, _)| is_valid(idx, cols, valid))
                .map(|(_, (&p, &t))| (p - t) * (p - t))
                .sum();
            dst[0] = 0.5 * sum;
            Ok(())
        })
    }

    fn left_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        self.residual(ctx, 1.0)
    }

    fn right_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        self.residual(ctx, -1.0)
    }

    fn backward_memory(&self, sides: Sides) -> Vec<Shape> {
        per_side(&self.input_shape, sides)
    }

    fn is_cost(&self) -> bool {
        true
    }
}

/// Softmax followed by cross-entropy, evaluated on the logits
///
/// `L = -Σ t · (x - lse(x))` per lane, where `lse` comes from the rescaled
/// `2^n` exponential sum. The logits gradient is `s · Σt - t`, which is
/// `s - t` for one-hot targets. The logarithm of a probability is never
/// formed.
pub struct SoftmaxCrossEntropyNode {
    axis: SoftmaxAxis,
    input_shape: Shape,
    shape: Shape,
    batch_shaped: bool,
    probabilities: TensorPointer,
}

impl SoftmaxCrossEntropyNode {
    pub fn new(axis: SoftmaxAxis, rows: usize, cols: usize) -> Self {
        Self {
            axis,
            input_shape: shape![rows, cols],
            shape: shape![1, 1],
            batch_shaped: false,
            probabilities: TensorPointer::NULL,
        }
    }

    /// Mask padding columns of partial batches
    pub fn batch_shaped(mut self, batch_shaped: bool) -> Self {
        self.batch_shaped = batch_shaped;
        self
    }

    fn dims(&self) -> (usize, usize) {
        (self.input_shape[0], self.input_shape[1])
    }

    /// Softmax output of the current step, null before the first forward
    pub fn probabilities(&self) -> TensorPointer {
        self.probabilities
    }
}

impl Operation for SoftmaxCrossEntropyNode {
    fn name(&self) -> &'static str {
        "softmax_cross_entropy"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let (x, t) = (ctx.left, ctx.right);
        let axis = self.axis;
        let (rows, cols) = self.dims();

        self.probabilities = ctx.produce(&self.input_shape, |view, dst| {
            let src = mat(&view, x, &[rows, cols])?;
            softmax(&src, axis, &mut MatMut::from_slice(dst, rows, cols)?)?;
            Ok(())
        })?;

        if ctx.mode == CostMode::Training {
            return Ok(TensorPointer::NULL);
        }

        let valid = live_columns(self.batch_shaped, &ctx.batch, cols);
        ctx.produce(&self.shape, |view, dst| {
            let x = mat(&view, x, &[rows, cols])?;
            let t = view.slice(t)?;
            let (lanes, len) = axis.lanes(rows, cols);
            let mut loss = 0.0;
            for lane in 0..lanes {
                let lse = lane_exp_sum(&x, axis, lane).ln();
                for k in 0..len {
                    let (i, j) = axis.coord(lane, k);
                    let target = t[i * cols + j];
                    if j < valid && target != 0.0 {
                        loss -= target * (x.get(i, j) - lse);
                    }
                }
            }
            dst[0] = loss;
            Ok(())
        })
    }

    fn left_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let scale = ctx.upstream_scale()?;
        let (s, t) = (self.probabilities, ctx.right);
        let axis = self.axis;
        let (rows, cols) = self.dims();
        let valid = live_columns(self.batch_shaped, &ctx.batch, cols);

        ctx.produce(&self.input_shape, |view, dst| {
            let (s, t) = (view.slice(s)?, view.slice(t)?);
            let (lanes, len) = axis.lanes(rows, cols);
            for lane in 0..lanes {
                let target_sum: f32 = (0..len)
                    .map(|k| axis.coord(lane, k))
                    .filter(|&(_, j)| j < valid)
                    .map(|(i, j)| t[i * cols + j])
                    .sum();
                for k in 0..len {
                    let (i, j) = axis.coord(lane, k);
                    let idx = i * cols + j;
                    let target = if j < valid { t[idx] } else { 0.0 };
                    dst[idx] = scale * (s[idx] * target_sum - target);
                }
            }
            Ok(())
        })
    }

    fn right_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let scale = ctx.upstream_scale()?;
        let x = ctx.left;
        let axis = self.axis;
        let (rows, cols) = self.dims();
        let valid = live_columns(self.batch_shaped, &ctx.batch, cols);

        ctx.produce(&self.input_shape, |view, dst| {
            let x = mat(&view, x, &[rows, cols])?;
            let (lanes, len) = axis.lanes(rows, cols);
            for lane in 0..lanes {
                let lse = lane_exp_sum(&x, axis, lane).ln();
                for k in 0..len {
                    let (i, j) = axis.coord(lane, k);
                    dst[i * cols + j] = if j < valid {
                        -scale * (x.get(i, j) - lse)
                    } else {
                        0.0
                    };
                }
            }
            Ok(())
        })
    }

    fn forward_memory(&self) -> Vec<Shape> {
        vec![self.input_shape.clone(), self.shape.clone()]
    }

    fn backward_memory(&self, sides: Sides) -> Vec<Shape> {
        per_side(&self.input_shape, sides)
    }

    fn is_cost(&self) -> bool {
        true
    }
}
