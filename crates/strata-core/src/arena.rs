//! Dual-region bump arena backing one training step.
//!
//! The arena owns three `f32` buffers, each sized once from an
//! [`ArenaCapacity`] and never grown:
//!
//! - the **forward** region holds every node output of the step,
//! - two **backward** slots hold derivative scratch. One slot plays the
//!   *current* role (new allocations land there), the other the *previous*
//!   role (read-only leftovers of the layer processed just before).
//!
//! Allocation only bumps a cursor. Individual allocations are never freed;
//! [`MemoryArena::reset`] rewinds every cursor at step start and
//! [`MemoryArena::swap_backward`] exchanges the backward roles between layers,
//! rewinding the slot that becomes current.
//!
//! Pointers record the physical slot, so a pointer handed out before a swap
//! keeps resolving to the same elements afterwards. Callers decide whether it
//! is still safe to read through [`MemoryArena::role_of`].
//!
//! # Examples
//!
//! ```
//! use strata_core::arena::{ArenaCapacity, BackwardRole, MemoryArena};
//!
//! let mut arena = MemoryArena::new(ArenaCapacity::new(16, 8));
//! let out = arena.allocate_forward(4).unwrap();
//! arena.slice_mut(out).unwrap().fill(1.0);
//!
//! let grad = arena.allocate_backward(4).unwrap();
//! assert_eq!(arena.role_of(grad), Some(BackwardRole::Current));
//! arena.swap_backward();
//! assert_eq!(arena.role_of(grad), Some(BackwardRole::Previous));
//! ```

use crate::address::{RegionKind, TensorPointer};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Element capacities of the arena regions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaCapacity {
    /// Elements available in the forward region
    pub forward: usize,
    /// Elements available in each backward slot
    pub backward: usize,
}

impl ArenaCapacity {
    /// Create a capacity description
    pub fn new(forward: usize, backward: usize) -> Self {
        Self { forward, backward }
    }

    /// Total number of elements the arena will hold (forward plus both slots)
    pub fn total_elements(&self) -> usize {
        self.forward + 2 * self.backward
    }
}

impl fmt::Display for ArenaCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "forward={} backward=2x{} ({} bytes)",
            self.forward,
            self.backward,
            self.total_elements() * std::mem::size_of::<f32>()
        )
    }
}

/// Role a backward slot plays at a given moment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardRole {
    /// Slot receiving new allocations
    Current,
    /// Slot written by the previously processed layer
    Previous,
}

/// Cursor snapshot of the arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaUsage {
    /// Elements allocated in the forward region
    pub forward: usize,
    /// Elements allocated in the current backward slot
    pub backward_current: usize,
    /// Elements allocated in the previous backward slot
    pub backward_previous: usize,
    /// Highest backward slot cursor seen since the last reset
    pub backward_peak: usize,
}

#[derive(Debug)]
struct Region {
    kind: RegionKind,
    data: Vec<f32>,
    cursor: usize,
}

impl Region {
    fn new(kind: RegionKind, capacity: usize) -> Self {
        Self {
            kind,
            data: vec![0.0; capacity],
            cursor: 0,
        }
    }

    fn allocate(&mut self, len: usize) -> CoreResult<TensorPointer> {
        let capacity = self.data.len();
        let end = self.cursor.checked_add(len).filter(|&end| end <= capacity);
        let Some(end) = end else {
            return Err(CoreError::CapacityExceeded {
                region: self.kind,
                requested: len,
                used: self.cursor,
                capacity,
            });
        };

        let ptr = TensorPointer::encode(self.kind, self.cursor, len)?;
        self.cursor = end;
        Ok(ptr)
    }

    fn check(&self, ptr: TensorPointer) -> CoreResult<Range<usize>> {
        if ptr.end() > self.cursor {
            return Err(CoreError::InvalidPointer {
                pointer: ptr,
                region: self.kind,
                allocated: self.cursor,
            });
        }
        Ok(ptr.range())
    }

    fn allocated(&self) -> &[f32] {
        &self.data[..self.cursor]
    }
}

/// Read-only view over arena elements that may be read while one output
/// tensor is being written.
///
/// Produced by [`MemoryArena::split_for_write`] (everything except the output
/// and whatever was allocated after it in the same region) and by
/// [`MemoryArena::view`] (everything allocated).
#[derive(Debug, Clone, Copy)]
pub struct ArenaView<'a> {
    forward: &'a [f32],
    backward: [&'a [f32]; 2],
}

impl<'a> ArenaView<'a> {
    fn region(&self, kind: RegionKind) -> &'a [f32] {
        match kind {
            RegionKind::Forward => self.forward,
            RegionKind::BackwardA => self.backward[0],
            RegionKind::BackwardB => self.backward[1],
        }
    }

    /// Elements addressed by `ptr`
    pub fn slice(&self, ptr: TensorPointer) -> CoreResult<&'a [f32]> {
        let (data, offset) = self.backing(ptr)?;
        Ok(&data[offset..offset + ptr.len()])
    }

    /// Whole readable region behind `ptr` plus the pointer's offset into it.
    ///
    /// Offset-addressed kernels take this pair directly.
    pub fn backing(&self, ptr: TensorPointer) -> CoreResult<(&'a [f32], usize)> {
        let kind = ptr.region().ok_or(CoreError::NullPointer)?;
        let data = self.region(kind);
        if ptr.end() > data.len() {
            return Err(CoreError::InvalidPointer {
                pointer: ptr,
                region: kind,
                allocated: data.len(),
            });
        }
        Ok((data, ptr.offset()))
    }
}

/// Forward region plus two alternating backward slots
#[derive(Debug)]
pub struct MemoryArena {
    forward: Region,
    backward: [Region; 2],
    current: usize,
    backward_peak: usize,
}

impl MemoryArena {
    /// Allocate all regions up front
    pub fn new(capacity: ArenaCapacity) -> Self {
        tracing::debug!(%capacity, "allocating memory arena");
        Self {
            forward: Region::new(RegionKind::Forward, capacity.forward),
            backward: [
                Region::new(RegionKind::BackwardA, capacity.backward),
                Region::new(RegionKind::BackwardB, capacity.backward),
            ],
            current: 0,
            backward_peak: 0,
        }
    }

    /// Configured capacities
    pub fn capacity(&self) -> ArenaCapacity {
        ArenaCapacity::new(self.forward.data.len(), self.backward[0].data.len())
    }

    /// Rewind every cursor; slot A becomes the current backward slot
    pub fn reset(&mut self) {
        self.forward.cursor = 0;
        for slot in &mut self.backward {
            slot.cursor = 0;
        }
        self.current = 0;
        self.backward_peak = 0;
    }

    /// Exchange backward roles and rewind the slot that becomes current
    pub fn swap_backward(&mut self) {
        self.current ^= 1;
        self.backward[self.current].cursor = 0;
    }

    /// Physical region of the current backward slot
    pub fn current_backward_region(&self) -> RegionKind {
        RegionKind::from_backward_slot(self.current)
    }

    /// Role of the backward slot `ptr` lives in, `None` for forward or null
    pub fn role_of(&self, ptr: TensorPointer) -> Option<BackwardRole> {
        let slot = ptr.region()?.backward_slot()?;
        if slot == self.current {
            Some(BackwardRole::Current)
        } else {
            Some(BackwardRole::Previous)
        }
    }

    /// Bump-allocate `len` elements in `region`
    pub fn allocate(&mut self, region: RegionKind, len: usize) -> CoreResult<TensorPointer> {
        let ptr = self.region_mut(region).allocate(len)?;
        if region.is_backward() {
            let cursor = self.region_mut(region).cursor;
            self.backward_peak = self.backward_peak.max(cursor);
        }
        Ok(ptr)
    }

    /// Allocate in the forward region
    pub fn allocate_forward(&mut self, len: usize) -> CoreResult<TensorPointer> {
        self.allocate(RegionKind::Forward, len)
    }

    /// Allocate in the current backward slot
    pub fn allocate_backward(&mut self, len: usize) -> CoreResult<TensorPointer> {
        self.allocate(self.current_backward_region(), len)
    }

    /// Read the elements behind `ptr`
    pub fn slice(&self, ptr: TensorPointer) -> CoreResult<&[f32]> {
        let region = self.region(ptr.region().ok_or(CoreError::NullPointer)?);
        let range = region.check(ptr)?;
        Ok(&region.data[range])
    }

    /// Mutable access to the elements behind `ptr`
    pub fn slice_mut(&mut self, ptr: TensorPointer) -> CoreResult<&mut [f32]> {
        let region = self.region_mut(ptr.region().ok_or(CoreError::NullPointer)?);
        let range = region.check(ptr)?;
        Ok(&mut region.data[range])
    }

    /// View over every allocated element
    pub fn view(&self) -> ArenaView<'_> {
        ArenaView {
            forward: self.forward.allocated(),
            backward: [self.backward[0].allocated(), self.backward[1].allocated()],
        }
    }

    /// Split the arena into the output tensor `out` and a read-only view of
    /// everything that cannot alias it.
    ///
    /// In the output's own region the view stops at `out.offset()`, so inputs
    /// must have been allocated before the output. Bump allocation gives
    /// exactly this order when a node allocates its output last.
    pub fn split_for_write(
        &mut self,
        out: TensorPointer,
    ) -> CoreResult<(ArenaView<'_>, &mut [f32])> {
        let kind = out.region().ok_or(CoreError::NullPointer)?;
        let forward = &mut self.forward;
        let [slot_a, slot_b] = &mut self.backward;

        match kind {
            RegionKind::Forward => {
                let range = forward.check(out)?;
                let (head, tail) = forward.data.split_at_mut(range.start);
                let view = ArenaView {
                    forward: head,
                    backward: [slot_a.allocated(), slot_b.allocated()],
                };
                Ok((view, &mut tail[..range.len()]))
            }
            RegionKind::BackwardA => {
                let range = slot_a.check(out)?;
                let (head, tail) = slot_a.data.split_at_mut(range.start);
                let view = ArenaView {
                    forward: forward.allocated(),
                    backward: [head, slot_b.allocated()],
                };
                Ok((view, &mut tail[..range.len()]))
            }
            RegionKind::BackwardB => {
                let range = slot_b.check(out)?;
                let (head, tail) = slot_b.data.split_at_mut(range.start);
                let view = ArenaView {
                    forward: forward.allocated(),
                    backward: [slot_a.allocated(), head],
                };
                Ok((view, &mut tail[..range.len()]))
            }
        }
    }

    /// Current cursors and the backward high-water mark
    pub fn usage(&self) -> ArenaUsage {
        ArenaUsage {
            forward: self.forward.cursor,
            backward_current: self.backward[self.current].cursor,
            backward_previous: self.backward[self.current ^ 1].cursor,
            backward_peak: self.backward_peak,
        }
    }

    fn region(&self, kind: RegionKind) -> &Region {
        match kind {
            RegionKind::Forward => &self.forward,
            RegionKind::BackwardA => &self.backward[0],
            RegionKind::BackwardB => &self.backward[1],
        }
    }

    fn region_mut(&mut self, kind: RegionKind) -> &mut Region {
        match kind {
            RegionKind::Forward => &mut self.forward,
            RegionKind::BackwardA => &mut self.backward[0],
            RegionKind::BackwardB => &mut self.backward[1],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_allocation_is_contiguous() {
        let mut arena = MemoryArena::new(ArenaCapacity::new(10, 0));
        let a = arena.allocate_forward(3).unwrap();
        let b = arena.allocate_forward(5).unwrap();

        assert_eq!(a.range(), 0..3);
        assert_eq!(b.range(), 3..8);
        assert_eq!(arena.usage().forward, 8);
    }

    #[test]
    fn test_capacity_violation_reports_region() {
        let mut arena = MemoryArena::new(ArenaCapacity::new(4, 6));
        arena.allocate_backward(4).unwrap();

        let err = arena.allocate_backward(3).unwrap_err();
        assert_eq!(
            err,
            CoreError::CapacityExceeded {
                region: RegionKind::BackwardA,
                requested: 3,
                used: 4,
                capacity: 6,
            }
        );
    }

    #[test]
    fn test_swap_alternates_slots_and_rewinds_current() {
        let mut arena = MemoryArena::new(ArenaCapacity::new(0, 8));
        let first = arena.allocate_backward(2).unwrap();
        arena.slice_mut(first).unwrap().copy_from_slice(&[1.0, 2.0]);
        assert_eq!(first.region(), Some(RegionKind::BackwardA));

        arena.swap_backward();
        assert_eq!(arena.role_of(first), Some(BackwardRole::Previous));
        let second = arena.allocate_backward(2).unwrap();
        assert_eq!(second.region(), Some(RegionKind::BackwardB));
        assert_eq!(arena.slice(first).unwrap(), &[1.0, 2.0]);

        // Slot A becomes current again and starts from zero
        arena.swap_backward();
        assert_eq!(arena.role_of(second), Some(BackwardRole::Previous));
        assert_eq!(arena.usage().backward_current, 0);
        assert!(arena.slice(first).is_err());
        let third = arena.allocate_backward(1).unwrap();
        assert_eq!(third.offset(), 0);
    }

    #[test]
    fn test_reset_rewinds_everything() {
        let mut arena = MemoryArena::new(ArenaCapacity::new(6, 6));
        let fwd = arena.allocate_forward(6).unwrap();
        arena.allocate_backward(4).unwrap();
        arena.swap_backward();
        arena.allocate_backward(5).unwrap();
        assert_eq!(arena.usage().backward_peak, 5);

        arena.reset();
        assert_eq!(arena.usage(), ArenaUsage::default());
        assert_eq!(arena.current_backward_region(), RegionKind::BackwardA);
        assert!(matches!(
            arena.slice(fwd),
            Err(CoreError::InvalidPointer { .. })
        ));
        assert_eq!(arena.allocate_forward(6).unwrap(), fwd);
    }

    #[test]
    fn test_null_pointer_is_rejected() {
        let mut arena = MemoryArena::new(ArenaCapacity::new(1, 1));
        assert_eq!(
            arena.slice(TensorPointer::NULL).unwrap_err(),
            CoreError::NullPointer
        );
        assert!(arena.split_for_write(TensorPointer::NULL).is_err());
    }

    #[test]
    fn test_split_for_write_reads_older_allocations() {
        let mut arena = MemoryArena::new(ArenaCapacity::new(4, 4));
        let input = arena.allocate_forward(2).unwrap();
        arena.slice_mut(input).unwrap().copy_from_slice(&[3.0, 4.0]);
        let older = arena.allocate_backward(2).unwrap();
        arena.slice_mut(older).unwrap().copy_from_slice(&[0.5, 0.5]);
        let out = arena.allocate_backward(2).unwrap();

        let (view, dst) = arena.split_for_write(out).unwrap();
        let x = view.slice(input).unwrap();
        let g = view.slice(older).unwrap();
        for ((d, a), b) in dst.iter_mut().zip(x).zip(g) {
            *d = a * b;
        }
        assert!(view.slice(out).is_err());

        assert_eq!(arena.slice(out).unwrap(), &[1.5, 2.0]);
    }

    #[test]
    fn test_backing_exposes_offset() {
        let mut arena = MemoryArena::new(ArenaCapacity::new(8, 0));
        arena.allocate_forward(3).unwrap();
        let b = arena.allocate_forward(4).unwrap();

        let view = arena.view();
        let (data, offset) = view.backing(b).unwrap();
        assert_eq!(offset, 3);
        assert_eq!(data.len(), 7);
    }
}
