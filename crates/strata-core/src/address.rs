//! Packed tensor pointers.
//!
//! A [`TensorPointer`] is a single `u64` carrying the region a tensor lives
//! in, its element offset within that region and its element count:
//!
//! ```text
//!  63 62 61                          31 30                           0
//! +-----+------------------------------+------------------------------+
//! | tag |       offset (31 bits)       |       length (31 bits)       |
//! +-----+------------------------------+------------------------------+
//! ```
//!
//! Tag 0 is reserved for [`TensorPointer::NULL`], so the all-zero value is
//! never a valid allocation. Decoding never touches the arena; a pointer only
//! means something relative to the [`MemoryArena`](crate::arena::MemoryArena)
//! that produced it.
//!
//! # Examples
//!
//! ```
//! use strata_core::address::{RegionKind, TensorPointer};
//!
//! let ptr = TensorPointer::encode(RegionKind::Forward, 128, 12).unwrap();
//! assert_eq!(ptr.region(), Some(RegionKind::Forward));
//! assert_eq!(ptr.offset(), 128);
//! assert_eq!(ptr.len(), 12);
//! assert!(TensorPointer::NULL.is_null());
//! ```

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

const TAG_SHIFT: u32 = 62;
const OFFSET_SHIFT: u32 = 31;
const FIELD_MASK: u64 = (1 << 31) - 1;

/// Largest offset or length a pointer can carry
pub const MAX_FIELD: usize = FIELD_MASK as usize;

/// Physical arena region a pointer refers to.
///
/// The two backward slots are physical buffers; which one currently plays the
/// "current" role is decided by the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    /// Forward activations, alive for the whole step
    Forward,
    /// First backward scratch slot
    BackwardA,
    /// Second backward scratch slot
    BackwardB,
}

impl RegionKind {
    fn tag(self) -> u64 {
        match self {
            RegionKind::Forward => 1,
            RegionKind::BackwardA => 2,
            RegionKind::BackwardB => 3,
        }
    }

    fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(RegionKind::Forward),
            2 => Some(RegionKind::BackwardA),
            3 => Some(RegionKind::BackwardB),
            _ => None,
        }
    }

    /// Whether this is one of the two backward slots
    pub fn is_backward(self) -> bool {
        !matches!(self, RegionKind::Forward)
    }

    /// Index of a backward slot (0 for A, 1 for B)
    pub fn backward_slot(self) -> Option<usize> {
        match self {
            RegionKind::Forward => None,
            RegionKind::BackwardA => Some(0),
            RegionKind::BackwardB => Some(1),
        }
    }

    /// Backward region for slot index 0 or 1
    pub fn from_backward_slot(slot: usize) -> Self {
        if slot == 0 {
            RegionKind::BackwardA
        } else {
            RegionKind::BackwardB
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegionKind::Forward => "forward",
            RegionKind::BackwardA => "backward-a",
            RegionKind::BackwardB => "backward-b",
        };
        f.write_str(name)
    }
}

/// Encoded `(region, offset, length)` triple
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorPointer(u64);

impl TensorPointer {
    /// The "no tensor" value. Must never be dereferenced.
    pub const NULL: TensorPointer = TensorPointer(0);

    /// Pack a region, offset and length into a pointer
    pub fn encode(region: RegionKind, offset: usize, len: usize) -> CoreResult<Self> {
        if offset > MAX_FIELD {
            return Err(CoreError::EncodingOverflow {
                field: "offset",
                value: offset,
                max: MAX_FIELD,
            });
        }
        if len > MAX_FIELD {
            return Err(CoreError::EncodingOverflow {
                field: "length",
                value: len,
                max: MAX_FIELD,
            });
        }

        Ok(TensorPointer(
            (region.tag() << TAG_SHIFT) | ((offset as u64) << OFFSET_SHIFT) | len as u64,
        ))
    }

    /// Rebuild a pointer from its raw bits
    pub const fn from_raw(bits: u64) -> Self {
        TensorPointer(bits)
    }

    /// Raw packed bits
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is [`TensorPointer::NULL`]
    pub fn is_null(self) -> bool {
        self.region().is_none()
    }

    /// Region tag, `None` for the null pointer
    pub fn region(self) -> Option<RegionKind> {
        RegionKind::from_tag(self.0 >> TAG_SHIFT)
    }

    /// Element offset within the region
    pub fn offset(self) -> usize {
        ((self.0 >> OFFSET_SHIFT) & FIELD_MASK) as usize
    }

    /// Number of elements
    pub fn len(self) -> usize {
        (self.0 & FIELD_MASK) as usize
    }

    /// Whether the pointer covers zero elements
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// One past the last element
    pub fn end(self) -> usize {
        self.offset() + self.len()
    }

    /// Element range within the region
    pub fn range(self) -> Range<usize> {
        self.offset()..self.end()
    }
}

impl fmt::Debug for TensorPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TensorPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region() {
            None => f.write_str("null"),
            Some(region) => write!(f, "{}[{}..{}]", region, self.offset(), self.end()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_is_zero() {
        assert_eq!(TensorPointer::NULL.raw(), 0);
        assert_eq!(TensorPointer::default(), TensorPointer::NULL);
        assert_eq!(TensorPointer::NULL.region(), None);
        assert_eq!(TensorPointer::NULL.to_string(), "null");
    }

    #[test]
    fn test_empty_allocation_is_not_null() {
        let ptr = TensorPointer::encode(RegionKind::Forward, 0, 0).unwrap();
        assert!(!ptr.is_null());
        assert!(ptr.is_empty());
    }

    #[test]
    fn test_field_limits() {
        let ptr = TensorPointer::encode(RegionKind::BackwardB, MAX_FIELD, MAX_FIELD).unwrap();
        assert_eq!(ptr.region(), Some(RegionKind::BackwardB));
        assert_eq!(ptr.offset(), MAX_FIELD);
        assert_eq!(ptr.len(), MAX_FIELD);

        let err = TensorPointer::encode(RegionKind::Forward, MAX_FIELD + 1, 1).unwrap_err();
        assert!(matches!(
            err,
            CoreError::EncodingOverflow {
                field: "offset",
                ..
            }
        ));
        let err = TensorPointer::encode(RegionKind::Forward, 0, MAX_FIELD + 1).unwrap_err();
        assert!(matches!(
            err,
            CoreError::EncodingOverflow {
                field: "length",
                ..
            }
        ));
    }

    #[test]
    fn test_display() {
        let ptr = TensorPointer::encode(RegionKind::BackwardA, 10, 6).unwrap();
        assert_eq!(ptr.to_string(), "backward-a[10..16]");
        assert_eq!(ptr.range(), 10..16);
    }

    #[test]
    fn test_backward_slots() {
        assert_eq!(RegionKind::BackwardA.backward_slot(), Some(0));
        assert_eq!(RegionKind::BackwardB.backward_slot(), Some(1));
        assert_eq!(RegionKind::Forward.backward_slot(), None);
        assert_eq!(RegionKind::from_backward_slot(1), RegionKind::BackwardB);
        assert!(!RegionKind::Forward.is_backward());
    }
}
