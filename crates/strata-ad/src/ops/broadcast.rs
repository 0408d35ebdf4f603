//! Vector broadcast node

use crate::node::{mat, OpContext, Operation, Sides};
use anyhow::Result;
use strata_core::{shape, Shape, TensorPointer};
use strata_kernels::{broadcast, reduce, BroadcastAxis, MatMut};

/// Replicates a vector across a `[rows, cols]` matrix; the gradient is the
/// sum along the same axis
pub struct BroadcastNode {
    axis: BroadcastAxis,
    vector_shape: Shape,
    shape: Shape,
}

impl BroadcastNode {
    pub fn new(axis: BroadcastAxis, vector_shape: Shape, rows: usize, cols: usize) -> Self {
        Self {
            axis,
            vector_shape,
            shape: shape![rows, cols],
        }
    }
}

impl Operation for BroadcastNode {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let v = ctx.left;
        let axis = self.axis;
        let (rows, cols) = (self.shape[0], self.shape[1]);
        ctx.produce(&self.shape, |view, dst| {
            broadcast(view.slice(v)?, axis, &mut MatMut::from_slice(dst, rows, cols)?)?;
            Ok(())
        })
    }

    fn left_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let g = ctx.upstream;
        let axis = self.axis;
        let shape = &self.shape;
        ctx.produce(&self.vector_shape, |view, dst| {
            reduce(&mat(&view, g, shape)?, axis, dst)?;
            Ok(())
        })
    }

    fn backward_memory(&self, sides: Sides) -> Vec<Shape> {
        if sides.left {
            vec![self.vector_shape.clone()]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CostMode;
    use crate::source::MiniBatch;
    use strata_core::{ArenaCapacity, MemoryArena};

    #[test]
    fn test_bias_broadcast_over_batch() -> Result<()> {
        // A length-2 bias replicated over 3 samples
        let mut node = BroadcastNode::new(BroadcastAxis::Columns, shape![2, 1], 2, 3);
        let mut arena = MemoryArena::new(ArenaCapacity::new(8, 8));
        let b = arena.allocate_forward(2)?;
        arena.slice_mut(b)?.copy_from_slice(&[1.0, -1.0]);

        let mut ctx = OpContext::forward(
            &mut arena,
            b,
            TensorPointer::NULL,
            MiniBatch::single(),
            CostMode::Training,
        );
        let out = node.forward(&mut ctx)?;
        assert_eq!(ctx.slice(out)?, &[1.0, 1.0, 1.0, -1.0, -1.0, -1.0]);

        let g = arena.allocate_backward(6)?;
        arena.slice_mut(g)?.copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut ctx = OpContext::backward(
            &mut arena,
            b,
            TensorPointer::NULL,
            out,
            g,
            MiniBatch::single(),
        );
        let db = node.left_backward(&mut ctx)?;
        assert_eq!(ctx.slice(db)?, &[6.0, 15.0]);
        Ok(())
    }

    #[test]
    fn test_rows_broadcast_gradient() -> Result<()> {
        let mut node = BroadcastNode::new(BroadcastAxis::Rows, shape![1, 2], 3, 2);
        assert_eq!(node.backward_memory(Sides::new(true, false)), vec![shape![1, 2]]);
        assert!(node.backward_memory(Sides::default()).is_empty());

        let mut arena = MemoryArena::new(ArenaCapacity::new(8, 8));
        let v = arena.allocate_forward(2)?;
        arena.slice_mut(v)?.copy_from_slice(&[3.0, 4.0]);
        let mut ctx = OpContext::forward(
            &mut arena,
            v,
            TensorPointer::NULL,
            MiniBatch::single(),
            CostMode::Training,
        );
        let out = node.forward(&mut ctx)?;

        let g = arena.allocate_backward(6)?;
        arena.slice_mut(g)?.fill(1.0);
        let mut ctx = OpContext::backward(
            &mut arena,
            v,
            TensorPointer::NULL,
            out,
            g,
            MiniBatch::single(),
        );
        let dv = node.left_backward(&mut ctx)?;
        assert_eq!(ctx.slice(dv)?, &[3.0, 3.0]);
        Ok(())
    }
}
