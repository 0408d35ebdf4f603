//! Elementwise binary nodes

use crate::node::{OpContext, Operation, Sides};
use anyhow::Result;
use strata_core::{Shape, TensorPointer};
use strata_kernels::{add, hadamard};

fn per_side(shape: &Shape, sides: Sides) -> Vec<Shape> {
    [sides.left, sides.right]
        .into_iter()
        .filter(|&side| side)
        .map(|_| shape.clone())
        .collect()
}

/// `z = x + y`
pub struct AddNode {
    shape: Shape,
}

impl AddNode {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }

    /// The derivative of a sum is the upstream gradient for both operands.
    /// Each side gets its own copy so the two contributions can be summed
    /// into different pending gradients independently.
    fn pass_through(&self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let g = ctx.upstream;
        ctx.produce(&self.shape, |view, dst| {
            dst.copy_from_slice(view.slice(g)?);
            Ok(())
        })
    }
}

impl Operation for AddNode {
    fn name(&self) -> &'static str {
        "add"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let (l, r) = (ctx.left, ctx.right);
        ctx.produce(&self.shape, |view, dst| {
            add(view.slice(l)?, view.slice(r)?, dst)?;
            Ok(())
        })
    }

    fn left_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        self.pass_through(ctx)
    }

    fn right_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        self.pass_through(ctx)
    }

    fn backward_memory(&self, sides: Sides) -> Vec<Shape> {
        per_side(&self.shape, sides)
    }
}

/// `z = x ⊙ y`
pub struct HadamardNode {
    shape: Shape,
}

impl HadamardNode {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }

    fn scaled_upstream(
        &self,
        ctx: &mut OpContext<'_>,
        other: TensorPointer,
    ) -> Result<TensorPointer> {
        let g = ctx.upstream;
        ctx.produce(&self.shape, |view, dst| {
            hadamard(view.slice(g)?, view.slice(other)?, dst)?;
            Ok(())
        })
    }
}

impl Operation for HadamardNode {
    fn name(&self) -> &'static str {
        "hadamard"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let (l, r) = (ctx.left, ctx.right);
        ctx.produce(&self.shape, |view, dst| {
            hadamard(view.slice(l)?, view.slice(r)?, dst)?;
            Ok(())
        })
    }

    fn left_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let r = ctx.right;
        self.scaled_upstream(ctx, r)
    }

    fn right_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let l = ctx.left;
        self.scaled_upstream(ctx, l)
    }

    fn backward_memory(&self, sides: Sides) -> Vec<Shape> {
        per_side(&self.shape, sides)
    }
}
