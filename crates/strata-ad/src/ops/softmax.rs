//! Stand-alone softmax node
//!
//! Used wherever a softmax is not the sole input of a cross-entropy cost
//! (or when fusion is disabled). The backward pass is the Jacobian-vector
//! product `s ⊙ (g - <g, s>)` taken per lane.

use crate::node::{mat, OpContext, Operation, Sides};
use anyhow::Result;
use strata_core::{shape, Shape, TensorPointer};
use strata_kernels::{softmax, MatMut, SoftmaxAxis};

pub struct SoftmaxNode {
    axis: SoftmaxAxis,
    shape: Shape,
}

impl SoftmaxNode {
    pub fn new(axis: SoftmaxAxis, rows: usize, cols: usize) -> Self {
        Self {
            axis,
            shape: shape![rows, cols],
        }
    }

    fn dims(&self) -> (usize, usize) {
        (self.shape[0], self.shape[1])
    }

    fn lanes(&self) -> usize {
        let (rows, cols) = self.dims();
        self.axis.lanes(rows, cols).0
    }
}

impl Operation for SoftmaxNode {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let x = ctx.left;
        let axis = self.axis;
        let (rows, cols) = self.dims();
        ctx.produce(&self.shape, |view, dst| {
            let src = mat(&view, x, &[rows, cols])?;
            softmax(&src, axis, &mut MatMut::from_slice(dst, rows, cols)?)?;
            Ok(())
        })
    }

    fn left_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let (s, g) = (ctx.output, ctx.upstream);
        let axis = self.axis;
        let (rows, cols) = self.dims();
        let (lanes, len) = axis.lanes(rows, cols);

        let dots = ctx.produce(&[lanes], |view, dst| {
            let (s, g) = (view.slice(s)?, view.slice(g)?);
            for (lane, dot) in dst.iter_mut().enumerate() {
                *dot = (0..len)
                    .map(|k| {
                        let (i, j) = axis.coord(lane, k);
                        s[i * cols + j] * g[i * cols + j]
                    })
                    .sum();
            }
            Ok(())
        })?;

        ctx.produce(&self.shape, |view, dst| {
            let (s, g, dots) = (view.slice(s)?, view.slice(g)?, view.slice(dots)?);
            for (lane, &dot) in dots.iter().enumerate() {
                for k in 0..len {
                    let (i, j) = axis.coord(lane, k);
                    let idx = i * cols + j;
                    dst[idx] = s[idx] * (g[idx] - dot);
                }
            }
            Ok(())
        })
    }

    fn backward_memory(&self, sides: Sides) -> Vec<Shape> {
        if sides.left {
            vec![shape![self.lanes()], self.shape.clone()]
        } else {
            Vec::new()
        }
    }
}
