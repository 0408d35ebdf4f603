//! Matrix product node

use crate::node::{mat, OpContext, Operation, Sides};
use anyhow::Result;
use strata_core::{shape, Shape, TensorPointer};
use strata_kernels::{matmul, transpose, MatMut};

/// `C[m, n] = A[m, k] · B[k, n]`
///
/// Backward:
/// - `dA = G · Bᵀ`, using a `[n, k]` scratch for `Bᵀ`
/// - `dB = Aᵀ · G`, using a `[k, m]` scratch for `Aᵀ`
pub struct MatMulNode {
    m: usize,
    k: usize,
    n: usize,
    shape: Shape,
}

impl MatMulNode {
    pub fn new(m: usize, k: usize, n: usize) -> Self {
        Self {
            m,
            k,
            n,
            shape: shape![m, n],
        }
    }

    fn transposed(
        ctx: &mut OpContext<'_>,
        src: TensorPointer,
        rows: usize,
        cols: usize,
    ) -> Result<TensorPointer> {
        ctx.produce(&[cols, rows], |view, dst| {
            let src = mat(&view, src, &[rows, cols])?;
            transpose(&src, &mut MatMut::from_slice(dst, cols, rows)?)?;
            Ok(())
        })
    }
}

impl Operation for MatMulNode {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let (l, r) = (ctx.left, ctx.right);
        let (m, k, n) = (self.m, self.k, self.n);
        ctx.produce(&self.shape, |view, dst| {
            let a = mat(&view, l, &[m, k])?;
            let b = mat(&view, r, &[k, n])?;
            matmul(&a, &b, &mut MatMut::from_slice(dst, m, n)?)?;
            Ok(())
        })
    }

    fn left_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let (m, k, n) = (self.m, self.k, self.n);
        let (g, r) = (ctx.upstream, ctx.right);
        let bt = Self::transposed(ctx, r, k, n)?;
        ctx.produce(&[m, k], |view, dst| {
            let g = mat(&view, g, &[m, n])?;
            let bt = mat(&view, bt, &[n, k])?;
            matmul(&g, &bt, &mut MatMut::from_slice(dst, m, k)?)?;
            Ok(())
        })
    }

    fn right_backward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        let (m, k, n) = (self.m, self.k, self.n);
        let (g, l) = (ctx.upstream, ctx.left);
        let at = Self::transposed(ctx, l, m, k)?;
        ctx.produce(&[k, n], |view, dst| {
            let at = mat(&view, at, &[k, m])?;
            let g = mat(&view, g, &[m, n])?;
            matmul(&at, &g, &mut MatMut::from_slice(dst, k, n)?)?;
            Ok(())
        })
    }

    fn backward_memory(&self, sides: Sides) -> Vec<Shape> {
        let (m, k, n) = (self.m, self.k, self.n);
        let mut shapes = Vec::new();
        if sides.left {
            shapes.push(shape![n, k]);
            shapes.push(shape![m, k]);
        }
        if sides.right {
            shapes.push(shape![k, m]);
            shapes.push(shape![k, n]);
        }
        shapes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{total_elements, CostMode};
    use crate::source::MiniBatch;
    use strata_core::{ArenaCapacity, MemoryArena};

    /// `y = W x` with `W` all 0.5 (3x4) and `x` all 1.0 (4x1)
    #[test]
    fn test_linear_map_contract() -> Result<()> {
        let mut node = MatMulNode::new(3, 4, 1);
        let sides = Sides::new(true, true);
        let backward = total_elements(&node.backward_memory(sides));
        let mut arena = MemoryArena::new(ArenaCapacity::new(12 + 4 + 3, 3 + backward));

        let w = arena.allocate_forward(12)?;
        arena.slice_mut(w)?.fill(0.5);
        let x = arena.allocate_forward(4)?;
        arena.slice_mut(x)?.fill(1.0);

        let mut ctx = OpContext::forward(&mut arena, w, x, MiniBatch::single(), CostMode::Training);
        let y = node.forward(&mut ctx)?;
        assert_eq!(ctx.slice(y)?, &[2.0, 2.0, 2.0]);

        let g = arena.allocate_backward(3)?;
        arena.slice_mut(g)?.fill(1.0);
        let mut ctx = OpContext::backward(&mut arena, w, x, y, g, MiniBatch::single());
        let dw = node.left_backward(&mut ctx)?;
        let dx = node.right_backward(&mut ctx)?;

        assert_eq!(ctx.slice(dw)?, &[1.0; 12]);
        assert_eq!(ctx.slice(dx)?, &[1.5; 4]);
        // Exactly the declared backward memory was used
        assert_eq!(arena.usage().backward_current, 3 + backward);
        Ok(())
    }

    #[test]
    fn test_rectangular_gradients() -> Result<()> {
        // A = [[1, 2, 3], [4, 5, 6]], B = [[1, 0], [0, 1], [1, 1]]
        let mut node = MatMulNode::new(2, 3, 2);
        let mut arena = MemoryArena::new(ArenaCapacity::new(16, 32));
        let a = arena.allocate_forward(6)?;
        arena.slice_mut(a)?.copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = arena.allocate_forward(6)?;
        arena.slice_mut(b)?.copy_from_slice(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        let mut ctx = OpContext::forward(&mut arena, a, b, MiniBatch::single(), CostMode::Training);
        let c = node.forward(&mut ctx)?;
        assert_eq!(ctx.slice(c)?, &[4.0, 5.0, 10.0, 11.0]);

        // G = [[1, 0], [0, 2]]
        let g = arena.allocate_backward(4)?;
        arena.slice_mut(g)?.copy_from_slice(&[1.0, 0.0, 0.0, 2.0]);
        let mut ctx = OpContext::backward(&mut arena, a, b, c, g, MiniBatch::single());

        // G · Bᵀ
        let da = node.left_backward(&mut ctx)?;
        assert_eq!(ctx.slice(da)?, &[1.0, 0.0, 1.0, 0.0, 2.0, 2.0]);
        // Aᵀ · G
        let db = node.right_backward(&mut ctx)?;
        assert_eq!(ctx.slice(db)?, &[1.0, 8.0, 2.0, 10.0, 3.0, 12.0]);
        Ok(())
    }
}
