//! Object, array and hybrid formatting
//!
//! Turns freshly reserved memory into a well-formed object: header word,
//! array length, zeroed payload. Callers hold a [`NoSafepointScope`] from
//! the moment the memory is reserved until the formatter returns, so a
//! collector never sees a half-written header or a partially zeroed object.
//!
//! Zeroing runs in word strides. Array payloads start right after the 4-byte
//! length field, which is not word aligned; a single 4-byte store patches
//! that gap before the word stores begin.
//!
//! [`NoSafepointScope`]: crate::safepoint::NoSafepointScope

use std::ptr;

use crate::config::PrefetchParameters;
use crate::layout::{ARRAY_LENGTH_OFFSET, OBJECT_ALIGNMENT, WORD_SIZE};
use crate::object::{Address, ObjectHeader, ObjectRef};
use crate::types::TypeDescriptor;

/// Upper bound for the straight-line zeroing sequence
pub const MAX_UNROLLED_STORES_LIMIT: usize = 16;

/// Write the header and optionally zero an instance.
///
/// # Safety
/// `[memory, memory + size)` must be writable, word aligned and owned by
/// the caller, and `size` must be at least the type's instance size.
#[inline(always)]
pub unsafe fn format_object(
    memory: Address,
    ty: &TypeDescriptor,
    size: usize,
    zero_fill: bool,
    remembered_set: bool,
    max_unrolled_stores: usize,
) -> ObjectRef {
    debug_assert!(!ty.layout().is_array_like());
    let header = ObjectHeader::new(ty.id(), remembered_set, false);
    // SAFETY: caller guarantees the memory range
    unsafe {
        write_header(memory, header);
        if zero_fill {
            zero_range(memory, ty.layout().first_field_offset(), size, max_unrolled_stores);
        }
        ObjectRef::from_address(memory).unwrap_unchecked()
    }
}

/// Write the header and length and optionally zero an array.
///
/// # Safety
/// Same as [`format_object`]; `size` must equal the type's array size for
/// `length`.
#[inline(always)]
#[allow(clippy::too_many_arguments)]
pub unsafe fn format_array(
    memory: Address,
    ty: &TypeDescriptor,
    length: usize,
    size: usize,
    zero_fill: bool,
    remembered_set: bool,
    unaligned: bool,
    max_unrolled_stores: usize,
) -> ObjectRef {
    debug_assert!(ty.layout().is_array_like());
    debug_assert_eq!(ty.layout().array_size_unchecked(length), size);
    let header = ObjectHeader::new(ty.id(), remembered_set, unaligned);
    // SAFETY: caller guarantees the memory range
    unsafe {
        write_header(memory, header);
        memory
            .offset(ARRAY_LENGTH_OFFSET)
            .as_mut_ptr::<u32>()
            .write(length as u32);
        if zero_fill {
            zero_range(memory, ty.layout().first_field_offset(), size, max_unrolled_stores);
        }
        ObjectRef::from_address(memory).unwrap_unchecked()
    }
}

/// Format a hybrid: zero the whole array region, then copy `overlay` into
/// the last `overlay.len()` bytes of the object.
///
/// Zeroing completes before the copy starts, so no byte of the object is
/// ever left uninitialized even if the copy is observed halfway.
///
/// # Safety
/// Same as [`format_array`]; `overlay` must fit behind the array base offset.
#[inline]
#[allow(clippy::too_many_arguments)]
pub unsafe fn format_hybrid(
    memory: Address,
    ty: &TypeDescriptor,
    element_count: usize,
    size: usize,
    overlay: &[u8],
    remembered_set: bool,
    unaligned: bool,
    max_unrolled_stores: usize,
) -> ObjectRef {
    debug_assert!(overlay.len() <= size - ty.layout().array_base_offset());
    // SAFETY: caller guarantees the memory range and overlay fit
    unsafe {
        let obj = format_array(
            memory,
            ty,
            element_count,
            size,
            true,
            remembered_set,
            unaligned,
            max_unrolled_stores,
        );
        if !overlay.is_empty() {
            let dst = memory.offset(size - overlay.len()).as_mut_ptr::<u8>();
            ptr::copy_nonoverlapping(overlay.as_ptr(), dst, overlay.len());
        }
        obj
    }
}

/// Write a header word
///
/// # Safety
/// `memory` must be writable and word aligned.
#[inline(always)]
pub unsafe fn write_header(memory: Address, header: ObjectHeader) {
    // SAFETY: caller guarantees alignment and ownership
    unsafe { memory.as_mut_ptr::<u64>().write(header.bits()) }
}

/// Read the header word of an object
///
/// # Safety
/// `obj` must point to a formatted object.
#[inline(always)]
pub unsafe fn read_header(obj: ObjectRef) -> ObjectHeader {
    // SAFETY: caller guarantees obj is formatted
    unsafe { ObjectHeader::from_bits(obj.address().as_mut_ptr::<u64>().read()) }
}

/// Read the length field of an array or hybrid
///
/// # Safety
/// `obj` must point to a formatted array or hybrid.
#[inline(always)]
pub unsafe fn read_length(obj: ObjectRef) -> usize {
    // SAFETY: caller guarantees obj is an array
    unsafe {
        obj.address()
            .offset(ARRAY_LENGTH_OFFSET)
            .as_mut_ptr::<u32>()
            .read() as usize
    }
}

/// Zero `[memory + from, memory + to)`.
///
/// `from` must be 4-byte aligned and `to` word aligned.
///
/// # Safety
/// The range must be writable and owned by the caller.
#[inline(always)]
pub unsafe fn zero_range(memory: Address, from: usize, to: usize, max_unrolled_stores: usize) {
    debug_assert!(from.is_multiple_of(4) && to.is_multiple_of(OBJECT_ALIGNMENT));
    let mut offset = from;
    // SAFETY: caller guarantees the range
    unsafe {
        if !offset.is_multiple_of(WORD_SIZE) && offset < to {
            memory.offset(offset).as_mut_ptr::<u32>().write(0);
            offset += 4;
        }
        if offset >= to {
            return;
        }
        let words = (to - offset) / WORD_SIZE;
        let start = memory.offset(offset).as_mut_ptr::<u64>();
        if words <= max_unrolled_stores.min(MAX_UNROLLED_STORES_LIMIT) {
            zero_words_unrolled(start, words);
        } else {
            zero_words(start, words);
        }
    }
}

/// Zero `words` words with a runtime loop
///
/// # Safety
/// `start` must be valid for `words` aligned word writes.
#[inline]
unsafe fn zero_words(start: *mut u64, words: usize) {
    for i in 0..words {
        // SAFETY: i < words
        unsafe { start.add(i).write(0) };
    }
}

/// Zero a fixed number of words as straight-line stores
///
/// # Safety
/// `start` must be valid for `N` aligned word writes.
#[inline(always)]
unsafe fn zero_fixed<const N: usize>(start: *mut u64) {
    // SAFETY: caller guarantees N words
    unsafe { start.cast::<[u64; N]>().write([0; N]) }
}

/// Zero up to [`MAX_UNROLLED_STORES_LIMIT`] words without a loop
///
/// # Safety
/// `start` must be valid for `words` aligned word writes.
#[inline(always)]
unsafe fn zero_words_unrolled(start: *mut u64, words: usize) {
    // SAFETY: each arm writes exactly `words` words
    unsafe {
        match words {
            0 => {}
            1 => zero_fixed::<1>(start),
            2 => zero_fixed::<2>(start),
            3 => zero_fixed::<3>(start),
            4 => zero_fixed::<4>(start),
            5 => zero_fixed::<5>(start),
            6 => zero_fixed::<6>(start),
            7 => zero_fixed::<7>(start),
            8 => zero_fixed::<8>(start),
            9 => zero_fixed::<9>(start),
            10 => zero_fixed::<10>(start),
            11 => zero_fixed::<11>(start),
            12 => zero_fixed::<12>(start),
            13 => zero_fixed::<13>(start),
            14 => zero_fixed::<14>(start),
            15 => zero_fixed::<15>(start),
            16 => zero_fixed::<16>(start),
            _ => zero_words(start, words),
        }
    }
}

/// Copy `[from, to)` of one object into another.
///
/// Word strides, with a leading 4-byte copy when `from` is not word aligned.
///
/// # Safety
/// Both ranges must be valid, non-overlapping, and `to` word aligned.
#[inline]
pub unsafe fn copy_payload(src: Address, dst: Address, from: usize, to: usize) {
    debug_assert!(from.is_multiple_of(4) && to.is_multiple_of(OBJECT_ALIGNMENT));
    let mut offset = from;
    // SAFETY: caller guarantees both ranges
    unsafe {
        if !offset.is_multiple_of(WORD_SIZE) && offset < to {
            let value = src.offset(offset).as_mut_ptr::<u32>().read();
            dst.offset(offset).as_mut_ptr::<u32>().write(value);
            offset += 4;
        }
        let src_words = src.offset(offset).as_mut_ptr::<u64>();
        let dst_words = dst.offset(offset).as_mut_ptr::<u64>();
        for i in 0..to.saturating_sub(offset) / WORD_SIZE {
            dst_words.add(i).write(src_words.add(i).read());
        }
    }
}

/// Prefetch the lines a following allocation is likely to touch
#[inline(always)]
pub fn prefetch_allocation(new_top: Address, params: &PrefetchParameters) {
    if !params.is_enabled() {
        return;
    }
    let mut addr = new_top.as_usize().wrapping_add(params.distance);
    for _ in 0..params.lines {
        prefetch_line(addr);
        addr = addr.wrapping_add(params.step);
    }
}

#[inline(always)]
#[allow(unused_unsafe)]
fn prefetch_line(addr: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{_MM_HINT_NTA, _mm_prefetch};
        // SAFETY: prefetching is a hint and never faults
        unsafe { _mm_prefetch::<_MM_HINT_NTA>(ptr::with_exposed_provenance::<i8>(addr)) };
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}
