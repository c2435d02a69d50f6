//! Slow-path allocation
//!
//! Entered when the TLAB cannot serve a request or the object must live in
//! an unaligned chunk. This is the only allocation code that may block: it
//! hands off to the collector, which can run a collection before answering.
//!
//! The sequence is fixed:
//!
//! 1. Move to a stack with room for the collector
//!    ([`with_stack_headroom`]); the thread's handoff state is restored on
//!    every exit, unwinding included.
//! 2. Under the allocation gate, ask the collector for memory: a fresh TLAB
//!    for small objects, falling back to an individual placement, or an
//!    unaligned chunk. If nothing is left, stop the mutators, collect once
//!    and ask again.
//! 3. Format the memory exactly as the fast path does, with header bits
//!    taken from the placement.
//! 4. Dirty the new object's reference region, whatever its header says.
//!    Compiled code elides barriers on initializing stores into objects it
//!    knows are fresh, and the collector may have placed this one in old
//!    memory.

use parking_lot::RwLockReadGuard;

use crate::allocator::{AllocStats, Shape, initialize};
use crate::barrier;
use crate::error::{AllocError, AllocResult};
use crate::heap::Heap;
use crate::layout::REFERENCE_SIZE;
use crate::object::{Address, ObjectRef};
use crate::safepoint::{self, NoSafepointScope, with_stack_headroom};
use crate::space::{CollectionCause, MemoryRequest, Placement};
use crate::tlab::Tlab;
use crate::types::TypeDescriptor;

/// Memory obtained for one object, with the gate that keeps collections out
/// until it is formatted
type Reservation<'h> = (RwLockReadGuard<'h, ()>, Address, Placement);

/// Allocate `size` bytes for `ty` outside the fast path
pub(crate) fn allocate(
    heap: &Heap,
    tlab: &mut Tlab,
    stats: &mut AllocStats,
    ty: &TypeDescriptor,
    size: usize,
    shape: Shape<'_>,
    unaligned: bool,
) -> AllocResult<ObjectRef> {
    debug_assert!(
        safepoint::safepoint_allowed(),
        "slow-path allocation inside a no-safepoint region"
    );

    let (_gate, memory, placement) = with_stack_headroom(heap.params(), || {
        let observed = heap.collector().collection_epoch();
        if let Some(reserved) = reserve(heap, tlab, stats, size, unaligned) {
            return Ok(reserved);
        }
        heap.collect_after(CollectionCause::AllocationFailure, observed);
        reserve(heap, tlab, stats, size, unaligned).ok_or_else(|| out_of_memory(heap, size))
    })?;
    debug_assert!(placement.end.offset_from(memory) >= size);

    #[cfg(feature = "gc_logging")]
    if unaligned {
        tracing::debug!(
            target: "genheap::alloc",
            ty = ty.name(),
            size,
            at = %placement.start,
            "Large array placed in unaligned chunk"
        );
    }

    let _scope = NoSafepointScope::enter();
    // SAFETY: the collector handed this memory to us exclusively
    let obj = unsafe {
        initialize(
            memory,
            ty,
            size,
            shape,
            placement.remembered_set(),
            placement.unaligned(),
            heap.params().max_unrolled_stores,
        )
    };
    dirty_fresh_object(heap, obj, ty, shape.length(), placement.unaligned());
    Ok(obj)
}

/// Report the reference region of a fresh object to the card table
pub(crate) fn dirty_fresh_object(
    heap: &Heap,
    obj: ObjectRef,
    ty: &TypeDescriptor,
    length: usize,
    unaligned: bool,
) {
    if let Some((start, end)) = reference_region(ty, length) {
        barrier::post_allocation(
            heap.card_table(),
            obj,
            unaligned,
            obj.address().offset(start),
            obj.address().offset(end),
        );
    }
}

/// One attempt at memory for `size` bytes, without collecting
fn reserve<'h>(
    heap: &'h Heap,
    tlab: &mut Tlab,
    stats: &mut AllocStats,
    size: usize,
    unaligned: bool,
) -> Option<Reservation<'h>> {
    let gate = heap.safepoint().allocation_gate();
    let (memory, placement) = if unaligned {
        let placement = heap.collector().obtain_memory(MemoryRequest::Object {
            size,
            unaligned: true,
        })?;
        (placement.start, placement)
    } else {
        match refill_tlab(heap, tlab, stats, size) {
            Some(allocated) => allocated,
            None => {
                let placement = heap.collector().obtain_memory(MemoryRequest::Object {
                    size,
                    unaligned: false,
                })?;
                (placement.start, placement)
            }
        }
    };
    Some((gate, memory, placement))
}

/// Retire the TLAB and bump-allocate from a fresh one
fn refill_tlab(
    heap: &Heap,
    tlab: &mut Tlab,
    stats: &mut AllocStats,
    size: usize,
) -> Option<(Address, Placement)> {
    if let Some((top, end)) = tlab.retire() {
        heap.collector().retire_tlab(top, end);
    }
    let placement = heap.collector().obtain_memory(MemoryRequest::Tlab)?;
    tlab.install(&placement);
    stats.tlab_refills += 1;

    #[cfg(feature = "gc_logging")]
    tracing::debug!(
        target: "genheap::alloc",
        start = %placement.start,
        size = placement.len(),
        old = placement.remembered_set(),
        refills = stats.tlab_refills,
        "TLAB refilled"
    );

    let memory = tlab.bump_allocate(size)?;
    Some((memory, placement))
}

fn out_of_memory(heap: &Heap, size: usize) -> AllocError {
    #[cfg(feature = "gc_logging")]
    tracing::warn!(
        target: "genheap::alloc",
        requested = size,
        epoch = heap.collector().collection_epoch(),
        "Out of memory"
    );
    #[cfg(not(feature = "gc_logging"))]
    let _ = heap;

    AllocError::OutOfMemory { requested: size }
}

/// Byte range `[start, end)` covering every reference slot of an object of
/// type `ty` with `length` elements, or `None` if it has no references
pub(crate) fn reference_region(ty: &TypeDescriptor, length: usize) -> Option<(usize, usize)> {
    let layout = ty.layout();
    let mut region: Option<(usize, usize)> = None;
    let mut include = |start: usize, end: usize| {
        if start < end {
            region = Some(match region {
                Some((lo, hi)) => (lo.min(start), hi.max(end)),
                None => (start, end),
            });
        }
    };

    if let (Some(&first), Some(&last)) = (ty.reference_offsets().first(), ty.reference_offsets().last()) {
        include(first as usize, last as usize + REFERENCE_SIZE);
    }
    if layout.has_reference_elements() {
        include(layout.array_base_offset(), layout.array_end_offset(length));
    }
    region
}
