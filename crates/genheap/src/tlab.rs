//! Thread-local allocation buffers
//!
//! Each mutator owns one TLAB: a private `[top, end)` window into an
//! aligned chunk, usually a young one. Bump allocation needs no atomics
//! because nothing else ever touches the owning thread's cursor.

use crate::layout::OBJECT_ALIGNMENT;
use crate::object::Address;
use crate::space::Placement;

/// Thread-local allocation buffer.
///
/// Invariant: `start <= top <= end`. Memory in `[top, end)` is zeroed or
/// unused and belongs to the owning thread until consumed.
#[derive(Debug)]
pub struct Tlab {
    /// Start of the current buffer (for statistics and retirement)
    start: Address,
    /// Next free byte
    top: Address,
    /// Exclusive end of the current buffer
    end: Address,
    /// Header bits of every object bumped from this buffer
    remembered_set: bool,
    unaligned: bool,
}

impl Tlab {
    /// A TLAB with no buffer; every bump allocation fails
    pub const fn empty() -> Self {
        Self {
            start: Address::NULL,
            top: Address::NULL,
            end: Address::NULL,
            remembered_set: false,
            unaligned: false,
        }
    }

    /// Next free byte
    #[inline(always)]
    pub fn top(&self) -> Address {
        self.top
    }

    /// Exclusive end of the buffer
    #[inline(always)]
    pub fn end(&self) -> Address {
        self.end
    }

    /// Remembered-set bit for objects in this buffer
    #[inline(always)]
    pub fn remembered_set(&self) -> bool {
        self.remembered_set
    }

    /// Unaligned bit for objects in this buffer
    #[inline(always)]
    pub fn unaligned(&self) -> bool {
        self.unaligned
    }

    /// Start of the buffer
    pub fn start(&self) -> Address {
        self.start
    }

    /// Remaining free bytes
    #[inline]
    pub fn free(&self) -> usize {
        self.end.offset_from(self.top)
    }

    /// Bytes handed out from the current buffer
    pub fn used(&self) -> usize {
        self.top.offset_from(self.start)
    }

    /// True if no buffer is installed
    pub fn is_empty(&self) -> bool {
        self.start.is_null()
    }

    /// True if `addr` lies within the current buffer
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Reserve `size` bytes, already rounded to the allocation granularity.
    ///
    /// Returns the old top on success. On failure nothing changes.
    #[inline(always)]
    pub fn bump_allocate(&mut self, size: usize) -> Option<Address> {
        debug_assert!(size.is_multiple_of(OBJECT_ALIGNMENT));
        let top = self.top;
        if size <= self.end.as_usize() - top.as_usize() {
            self.top = top.offset(size);
            Some(top)
        } else {
            None
        }
    }

    /// Install the placement as a fresh buffer; objects bumped from it get
    /// the placement's header bits.
    ///
    /// Returns the unused remainder of the previous buffer, if any.
    pub fn install(&mut self, placement: &Placement) -> Option<(Address, Address)> {
        debug_assert!(placement.start <= placement.end);
        debug_assert!(placement.start.is_aligned(OBJECT_ALIGNMENT));
        let remainder = self.retire();
        *self = Self {
            start: placement.start,
            top: placement.start,
            end: placement.end,
            remembered_set: placement.remembered_set(),
            unaligned: placement.unaligned(),
        };
        remainder
    }

    /// Give up the current buffer.
    ///
    /// Returns the unused `[top, end)` remainder if it is non-empty.
    pub fn retire(&mut self) -> Option<(Address, Address)> {
        let remainder = (self.top < self.end).then_some((self.top, self.end));
        *self = Self::empty();
        remainder
    }
}

impl Default for Tlab {
    fn default() -> Self {
        Self::empty()
    }
}
