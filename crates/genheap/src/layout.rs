//! Object layout encoding
//!
//! Every type carries a compact [`LayoutEncoding`] from which the allocator
//! derives sizes and offsets. All functions here are pure.
//!
//! ## Layout
//!
//! ```text
//! Instance:            Array / Hybrid:
//! ┌──────────────┐     ┌──────────────┐ 0
//! │ header (8)   │     │ header (8)   │
//! ├──────────────┤ 8   ├──────────────┤ 8
//! │ fields ...   │     │ length (4)   │
//! │              │     ├──────────────┤ 12
//! └──────────────┘     │ fixed/pad    │
//!                      ├──────────────┤ base offset
//!                      │ elements ... │
//!                      └──────────────┘ size (rounded to 8)
//! ```

use std::fmt;

use crate::error::{AllocError, AllocResult};

/// Machine word size in bytes
pub const WORD_SIZE: usize = 8;

/// Allocation granularity; every object size is a multiple of this
pub const OBJECT_ALIGNMENT: usize = 8;

/// Size of the object header word
pub const HEADER_SIZE: usize = WORD_SIZE;

/// Offset of the 32-bit array length field
pub const ARRAY_LENGTH_OFFSET: usize = HEADER_SIZE;

/// Size of the array length field
pub const ARRAY_LENGTH_SIZE: usize = 4;

/// First byte after the array length field
pub const ARRAY_HEADER_END: usize = ARRAY_LENGTH_OFFSET + ARRAY_LENGTH_SIZE;

/// Size of a reference slot
pub const REFERENCE_SIZE: usize = WORD_SIZE;

/// Round `value` up to a multiple of `align` (a power of two)
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two)
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Shape of an allocatable type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    /// Fixed-size object
    Instance = 0,
    /// Array: header, length, elements
    Array = 1,
    /// Array-shaped object with fixed fields before its elements
    Hybrid = 2,
}

const KIND_MASK: u64 = 0b11;
const REFERENCE_BIT: u64 = 1 << 2;
const LOG2_SHIFT: u32 = 3;
const LOG2_MASK: u64 = 0b111;
const BASE_SHIFT: u32 = 8;
const BASE_MASK: u64 = 0xFFFF;
const SIZE_SHIFT: u32 = 32;

/// Bit-packed layout descriptor.
///
/// ```text
/// bits 0-1    kind (instance, array, hybrid)
/// bit  2      elements are references
/// bits 3-5    log2(element size)
/// bits 8-23   array base offset
/// bits 32-63  instance size
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutEncoding(u64);

impl LayoutEncoding {
    /// Encoding for a fixed-size object of `size` bytes (header included)
    pub const fn instance(size: usize) -> Self {
        let size = if size < HEADER_SIZE { HEADER_SIZE } else { size };
        let size = align_up(size, OBJECT_ALIGNMENT);
        assert!(size <= u32::MAX as usize, "instance too large");
        Self(LayoutKind::Instance as u64 | ((size as u64) << SIZE_SHIFT))
    }

    /// Encoding for an array whose elements are `element_size` bytes
    pub const fn array(element_size: usize, reference: bool) -> Self {
        Self::array_like(LayoutKind::Array, ARRAY_HEADER_END, element_size, reference)
    }

    /// Encoding for a hybrid whose fixed fields end at `fixed_end`
    pub const fn hybrid(fixed_end: usize, element_size: usize, reference: bool) -> Self {
        let fixed_end = if fixed_end < ARRAY_HEADER_END {
            ARRAY_HEADER_END
        } else {
            fixed_end
        };
        Self::array_like(LayoutKind::Hybrid, fixed_end, element_size, reference)
    }

    const fn array_like(
        kind: LayoutKind,
        fixed_end: usize,
        element_size: usize,
        reference: bool,
    ) -> Self {
        assert!(
            element_size.is_power_of_two() && element_size <= WORD_SIZE,
            "element size must be 1, 2, 4 or 8"
        );
        assert!(
            !reference || element_size == REFERENCE_SIZE,
            "reference elements must be word sized"
        );
        let base = align_up(fixed_end, element_size);
        assert!(base as u64 <= BASE_MASK, "array base offset too large");

        let mut bits = kind as u64;
        if reference {
            bits |= REFERENCE_BIT;
        }
        bits |= (element_size.trailing_zeros() as u64) << LOG2_SHIFT;
        bits |= (base as u64) << BASE_SHIFT;
        Self(bits)
    }

    /// Raw encoded value
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Layout kind
    #[inline]
    pub const fn kind(self) -> LayoutKind {
        match self.0 & KIND_MASK {
            0 => LayoutKind::Instance,
            1 => LayoutKind::Array,
            _ => LayoutKind::Hybrid,
        }
    }

    /// True for arrays and hybrids
    #[inline]
    pub const fn is_array_like(self) -> bool {
        self.0 & KIND_MASK != LayoutKind::Instance as u64
    }

    /// True if the elements are references
    #[inline]
    pub const fn has_reference_elements(self) -> bool {
        self.is_array_like() && self.0 & REFERENCE_BIT != 0
    }

    /// log2 of the element size (arrays and hybrids)
    #[inline]
    pub const fn log2_element_size(self) -> u32 {
        ((self.0 >> LOG2_SHIFT) & LOG2_MASK) as u32
    }

    /// Element size in bytes (arrays and hybrids)
    #[inline]
    pub const fn element_size(self) -> usize {
        1 << self.log2_element_size()
    }

    /// Fixed size of an instance
    #[inline]
    pub const fn instance_size(self) -> usize {
        debug_assert!(!self.is_array_like());
        (self.0 >> SIZE_SHIFT) as usize
    }

    /// Offset of element 0
    #[inline]
    pub const fn array_base_offset(self) -> usize {
        debug_assert!(self.is_array_like());
        ((self.0 >> BASE_SHIFT) & BASE_MASK) as usize
    }

    /// Offset of element `index`
    #[inline]
    pub const fn element_offset(self, index: usize) -> usize {
        self.array_base_offset() + (index << self.log2_element_size())
    }

    /// First byte after the last element, before rounding
    #[inline]
    pub const fn array_end_offset(self, length: usize) -> usize {
        self.element_offset(length)
    }

    /// First byte that is not header or length field.
    ///
    /// Zeroing and cloning start here. For arrays whose base offset is
    /// padded this includes the padding.
    #[inline]
    pub const fn first_field_offset(self) -> usize {
        if self.is_array_like() {
            ARRAY_HEADER_END
        } else {
            HEADER_SIZE
        }
    }

    /// Total size of an array or hybrid with `length` elements.
    ///
    /// Rejects a negative length before doing any arithmetic.
    #[inline]
    pub fn array_size(self, length: i32) -> AllocResult<usize> {
        if length < 0 {
            return Err(AllocError::InvalidLength(length));
        }
        Ok(self.array_size_unchecked(length as usize))
    }

    /// Total size for an already validated length
    #[inline]
    pub const fn array_size_unchecked(self, length: usize) -> usize {
        align_up(self.array_end_offset(length), OBJECT_ALIGNMENT)
    }

    /// Object size given the length stored in an object (0 for instances)
    #[inline]
    pub const fn object_size(self, length: usize) -> usize {
        if self.is_array_like() {
            self.array_size_unchecked(length)
        } else {
            self.instance_size()
        }
    }
}

impl fmt::Debug for LayoutEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("LayoutEncoding");
        s.field("kind", &self.kind());
        if self.is_array_like() {
            s.field("element_size", &self.element_size())
                .field("reference", &self.has_reference_elements())
                .field("base", &self.array_base_offset());
        } else {
            s.field("size", &self.instance_size());
        }
        s.finish()
    }
}
