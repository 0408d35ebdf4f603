//! Node identity, the operation contract and the per-call execution context.
//!
//! Every executable node implements [`Operation`]. The scheduler never looks
//! inside a node: it hands it an [`OpContext`] carrying the arena, the
//! pointers of the node's predecessors and (in the backward phase) the
//! upstream gradient, and receives a [`TensorPointer`] back.
//!
//! Nodes allocate from whatever region the context is bound to. In the
//! forward phase that is the forward region; in the backward phase it is the
//! current backward slot. Whatever a node allocates during a call must be
//! declared up front through [`Operation::forward_memory`] and
//! [`Operation::backward_memory`] so the compiler can size the arena.

use crate::source::MiniBatch;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use strata_core::arena::ArenaView;
use strata_core::shape::{matrix_dims, stride};
use strata_core::{MemoryArena, Shape, TensorPointer};
use strata_kernels::MatRef;

/// Index of a node inside a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Whether the terminal cost materialises its scalar loss
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostMode {
    /// Only the state needed by the backward pass is produced
    #[default]
    Training,
    /// The scalar loss is written to the forward region
    FullPass,
}

/// Which predecessors need a derivative contribution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sides {
    pub left: bool,
    pub right: bool,
}

impl Sides {
    pub fn new(left: bool, right: bool) -> Self {
        Self { left, right }
    }

    /// At least one side needs a contribution
    pub fn any(self) -> bool {
        self.left || self.right
    }
}

/// Phase a context is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Forward,
    Backward,
}

/// Everything a node may touch during one forward or backward call
pub struct OpContext<'a> {
    arena: &'a mut MemoryArena,
    phase: Phase,
    /// Forward output of the left predecessor (null when absent)
    pub left: TensorPointer,
    /// Forward output of the right predecessor (null when absent)
    pub right: TensorPointer,
    /// This node's own forward output (null in the forward phase)
    pub output: TensorPointer,
    /// Accumulated gradient of this node's output (null when the node
    /// generates its own gradient)
    pub upstream: TensorPointer,
    /// The mini-batch being processed
    pub batch: MiniBatch,
    /// Evaluation mode for cost nodes
    pub mode: CostMode,
}

impl<'a> OpContext<'a> {
    /// Context for a forward call
    pub fn forward(
        arena: &'a mut MemoryArena,
        left: TensorPointer,
        right: TensorPointer,
        batch: MiniBatch,
        mode: CostMode,
    ) -> Self {
        Self {
            arena,
            phase: Phase::Forward,
            left,
            right,
            output: TensorPointer::NULL,
            upstream: TensorPointer::NULL,
            batch,
            mode,
        }
    }

    /// Context for a backward call
    pub fn backward(
        arena: &'a mut MemoryArena,
        left: TensorPointer,
        right: TensorPointer,
        output: TensorPointer,
        upstream: TensorPointer,
        batch: MiniBatch,
    ) -> Self {
        Self {
            arena,
            phase: Phase::Backward,
            left,
            right,
            output,
            upstream,
            batch,
            mode: CostMode::FullPass,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Allocate a tensor of `shape` in the region of the current phase
    pub fn allocate(&mut self, shape: &[usize]) -> Result<TensorPointer> {
        let len = stride(shape);
        let ptr = match self.phase {
            Phase::Forward => self.arena.allocate_forward(len),
            Phase::Backward => self.arena.allocate_backward(len),
        };
        ptr.map_err(|err| {
            tracing::error!(error = %err, phase = ?self.phase, "arena capacity violation");
            anyhow::Error::new(err)
        })
    }

    /// Read a tensor
    pub fn slice(&self, ptr: TensorPointer) -> Result<&[f32]> {
        Ok(self.arena.slice(ptr)?)
    }

    /// Run `f` with mutable access to `out` and read access to every tensor
    /// allocated before it
    pub fn write<R>(
        &mut self,
        out: TensorPointer,
        f: impl FnOnce(ArenaView<'_>, &mut [f32]) -> Result<R>,
    ) -> Result<R> {
        let (view, dst) = self.arena.split_for_write(out)?;
        f(view, dst)
    }

    /// Allocate `shape` and fill it through [`write`](Self::write)
    pub fn produce(
        &mut self,
        shape: &[usize],
        f: impl FnOnce(ArenaView<'_>, &mut [f32]) -> Result<()>,
    ) -> Result<TensorPointer> {
        let out = self.allocate(shape)?;
        self.write(out, f)?;
        Ok(out)
    }

    /// Multiplier applied to a cost gradient: the upstream scalar when the
    /// cost feeds another node, one when it is the terminal
    pub fn upstream_scale(&self) -> Result<f32> {
        if self.upstream.is_null() {
            return Ok(1.0);
        }
        self.slice(self.upstream)?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("empty upstream gradient"))
    }
}

/// Offset matrix view of the tensor behind `ptr`
pub fn mat<'v>(
    view: &ArenaView<'v>,
    ptr: TensorPointer,
    shape: &[usize],
) -> Result<MatRef<'v, f32>> {
    let (rows, cols) = matrix_dims(shape)?;
    let (data, offset) = view.backing(ptr)?;
    Ok(MatRef::new(data, offset, rows, cols)?)
}

/// The contract every executable node implements
///
/// `left_backward` and `right_backward` return the derivative of the
/// loss with respect to the left and right predecessor output. The returned
/// pointer must be the last tensor the call allocated; the scheduler adds
/// any previously pending gradient into it in place.
pub trait Operation {
    /// Short operator name used in logs and errors
    fn name(&self) -> &'static str;

    /// Output shape
    fn shape(&self) -> &Shape;

    /// Evaluate the node, returning its output pointer
    fn forward(&mut self, ctx: &mut OpContext<'_>) -> Result<TensorPointer>;

    /// Contribution to the left predecessor's gradient
    fn left_backward(&mut self, _ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        Err(anyhow!("{} has no left operand to differentiate", self.name()))
    }

    /// Contribution to the right predecessor's gradient
    fn right_backward(&mut self, _ctx: &mut OpContext<'_>) -> Result<TensorPointer> {
        Err(anyhow!("{} has no right operand to differentiate", self.name()))
    }

    /// Shapes allocated by one forward call
    fn forward_memory(&self) -> Vec<Shape> {
        vec![self.shape().clone()]
    }

    /// Shapes allocated by the backward calls for `sides`
    fn backward_memory(&self, sides: Sides) -> Vec<Shape>;

    /// Whether this node must receive a gradient, given which of its
    /// predecessors do
    fn requires_backward_value(&self, sides: Sides) -> bool {
        sides.any()
    }

    /// Whether the node is a loss function
    fn is_cost(&self) -> bool {
        false
    }

    /// Called once per step before any forward evaluation
    fn on_mini_batch(&mut self, _batch: MiniBatch) {}
}

/// Sum of element counts of `shapes`
pub fn total_elements(shapes: &[Shape]) -> usize {
    shapes.iter().map(|s| stride(s)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::shape;
    use strata_core::ArenaCapacity;

    #[test]
    fn test_context_allocates_in_phase_region() -> Result<()> {
        let mut arena = MemoryArena::new(ArenaCapacity::new(8, 8));
        let batch = MiniBatch::single();

        let mut ctx = OpContext::forward(
            &mut arena,
            TensorPointer::NULL,
            TensorPointer::NULL,
            batch,
            CostMode::FullPass,
        );
        let out = ctx.allocate(&shape![2, 2])?;
        assert_eq!(out.region(), Some(strata_core::RegionKind::Forward));

        let mut ctx = OpContext::backward(
            &mut arena,
            TensorPointer::NULL,
            TensorPointer::NULL,
            out,
            TensorPointer::NULL,
            batch,
        );
        let grad = ctx.allocate(&shape![2, 2])?;
        assert_eq!(grad.region(), Some(strata_core::RegionKind::BackwardA));
        Ok(())
    }

    #[test]
    fn test_capacity_violation_is_core_error() {
        let mut arena = MemoryArena::new(ArenaCapacity::new(3, 0));
        let mut ctx = OpContext::forward(
            &mut arena,
            TensorPointer::NULL,
            TensorPointer::NULL,
            MiniBatch::single(),
            CostMode::Training,
        );
        let err = ctx.allocate(&shape![2, 2]).unwrap_err();
        let core = err.downcast_ref::<strata_core::CoreError>().unwrap();
        assert!(core.is_capacity_violation());
    }

    #[test]
    fn test_write_reads_earlier_tensor() -> Result<()> {
        let mut arena = MemoryArena::new(ArenaCapacity::new(8, 0));
        let mut ctx = OpContext::forward(
            &mut arena,
            TensorPointer::NULL,
            TensorPointer::NULL,
            MiniBatch::single(),
            CostMode::FullPass,
        );
        let a = ctx.allocate(&shape![2])?;
        ctx.write(a, |_, dst| {
            dst.copy_from_slice(&[1.0, 2.0]);
            Ok(())
        })?;
        let b = ctx.allocate(&shape![2])?;
        ctx.write(b, |view, dst| {
            let src = view.slice(a)?;
            for (d, s) in dst.iter_mut().zip(src) {
                *d = s * 10.0;
            }
            Ok(())
        })?;
        assert_eq!(ctx.slice(b)?, &[10.0, 20.0]);
        Ok(())
    }

    #[test]
    fn test_total_elements() {
        assert_eq!(total_elements(&[shape![2, 3], shape![4]]), 10);
        assert_eq!(total_elements(&[]), 0);
    }
}
