//! Thread-local allocator
//!
//! A [`Mutator`] is a thread's handle on the heap. It owns the thread's TLAB
//! and serves every allocation with a bump of its cursor. Anything the TLAB
//! cannot serve goes through the slow path (see [`crate::slow_path`]), which
//! formats objects bit-identically.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::config::HeapParameters;
use crate::error::{AllocError, AllocResult};
use crate::format;
use crate::heap::Heap;
use crate::object::{Address, ObjectRef};
use crate::safepoint::{MutatorState, NoSafepointScope};
use crate::slow_path;
use crate::space::Placement;
use crate::tlab::Tlab;
use crate::types::TypeDescriptor;

thread_local! {
    /// Set while this thread owns a mutator
    static ATTACHED: Cell<bool> = const { Cell::new(false) };
}

/// Per-mutator allocation counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Allocations served by a TLAB bump
    pub fast_allocations: u64,
    /// Allocations that went through the slow path
    pub slow_allocations: u64,
    /// Fresh TLABs installed
    pub tlab_refills: u64,
    /// Bytes handed out, both paths
    pub bytes_allocated: u64,
}

/// How a reserved block becomes an object
#[derive(Debug, Clone, Copy)]
pub(crate) enum Shape<'a> {
    Instance,
    Array { length: usize },
    Hybrid { length: usize, overlay: &'a [u8] },
    Clone { source: ObjectRef, length: usize },
}

impl Shape<'_> {
    /// Element count (0 for instances)
    pub(crate) fn length(&self) -> usize {
        match *self {
            Shape::Instance => 0,
            Shape::Array { length }
            | Shape::Hybrid { length, .. }
            | Shape::Clone { length, .. } => length,
        }
    }
}

/// Turn `[memory, memory + size)` into an object of type `ty`.
///
/// Both allocation paths go through here so the objects they produce are
/// identical apart from the header bits describing their chunk.
///
/// # Safety
/// The range must be reserved for the caller, word aligned, and the caller
/// must hold a [`NoSafepointScope`]. For clones, `source` must be a live
/// object of type `ty` and size `size`.
#[inline(always)]
pub(crate) unsafe fn initialize(
    memory: Address,
    ty: &TypeDescriptor,
    size: usize,
    shape: Shape<'_>,
    remembered_set: bool,
    unaligned: bool,
    max_unrolled_stores: usize,
) -> ObjectRef {
    debug_assert!(!crate::safepoint::safepoint_allowed());
    // SAFETY: forwarded from the caller
    unsafe {
        match shape {
            Shape::Instance => {
                format::format_object(memory, ty, size, true, remembered_set, max_unrolled_stores)
            }
            Shape::Array { length } => format::format_array(
                memory,
                ty,
                length,
                size,
                true,
                remembered_set,
                unaligned,
                max_unrolled_stores,
            ),
            Shape::Hybrid { length, overlay } => format::format_hybrid(
                memory,
                ty,
                length,
                size,
                overlay,
                remembered_set,
                unaligned,
                max_unrolled_stores,
            ),
            Shape::Clone { source, length } => {
                let obj = if ty.layout().is_array_like() {
                    format::format_array(
                        memory,
                        ty,
                        length,
                        size,
                        false,
                        remembered_set,
                        unaligned,
                        max_unrolled_stores,
                    )
                } else {
                    format::format_object(
                        memory,
                        ty,
                        size,
                        false,
                        remembered_set,
                        max_unrolled_stores,
                    )
                };
                format::copy_payload(
                    source.address(),
                    memory,
                    ty.layout().first_field_offset(),
                    size,
                );
                obj
            }
        }
    }
}

/// True if objects of this type and size bypass the TLAB
#[inline(always)]
pub(crate) fn needs_unaligned_chunk(ty: &TypeDescriptor, size: usize, threshold: usize) -> bool {
    ty.layout().is_array_like() && (size > threshold || ty.requires_unaligned_allocation())
}

/// A thread's allocation handle.
///
/// Not `Send`: the TLAB belongs to the thread that attached. At most one
/// mutator exists per thread; dropping it retires the TLAB and detaches.
pub struct Mutator {
    heap: Arc<Heap>,
    /// Registered with the heap's safepoint
    state: Arc<CachePadded<MutatorState>>,
    tlab: Tlab,
    stats: AllocStats,
    large_array_threshold: usize,
    _thread_bound: PhantomData<*const ()>,
}

impl Mutator {
    pub(crate) fn attach(heap: Arc<Heap>) -> Option<Self> {
        if ATTACHED.with(|attached| attached.replace(true)) {
            return None;
        }
        let large_array_threshold = heap
            .params()
            .large_array_threshold
            .min(heap.collector().large_array_threshold());
        let state = heap.safepoint().register();
        Some(Self {
            heap,
            state,
            tlab: Tlab::empty(),
            stats: AllocStats::default(),
            large_array_threshold,
            _thread_bound: PhantomData,
        })
    }

    /// The heap this mutator allocates from
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Allocation counters
    pub fn stats(&self) -> AllocStats {
        self.stats
    }

    /// The thread's TLAB
    pub fn tlab(&self) -> &Tlab {
        &self.tlab
    }

    /// Replace the TLAB with `placement`, giving the old remainder back.
    ///
    /// The placement must come from this heap's collector and not be owned
    /// by any other thread. Objects bumped from it get its header bits.
    pub fn install_tlab(&mut self, placement: Placement) {
        if let Some((top, old_end)) = self.tlab.install(&placement) {
            self.heap.collector().retire_tlab(top, old_end);
        }
    }

    /// Give the TLAB back to the collector
    pub fn retire_tlab(&mut self) {
        if let Some((top, end)) = self.tlab.retire() {
            self.heap.collector().retire_tlab(top, end);
        }
    }

    fn params(&self) -> &HeapParameters {
        self.heap.params()
    }

    /// Allocate an instance of `ty`
    ///
    /// # Panics
    /// If `ty` is an array or hybrid type.
    pub fn allocate_instance(&mut self, ty: &TypeDescriptor) -> AllocResult<ObjectRef> {
        assert!(
            !ty.layout().is_array_like(),
            "{} is an array type",
            ty.name()
        );
        if !ty.is_instantiated() {
            return Err(AllocError::UninstantiatedType(ty.id()));
        }
        let size = ty.layout().instance_size();
        self.allocate(ty, size, Shape::Instance)
    }

    /// Allocate an array of `ty` with `length` elements
    ///
    /// # Panics
    /// If `ty` is an instance type.
    pub fn allocate_array(&mut self, ty: &TypeDescriptor, length: i32) -> AllocResult<ObjectRef> {
        assert!(
            ty.layout().is_array_like(),
            "{} is not an array type",
            ty.name()
        );
        if !ty.is_instantiated() {
            return Err(AllocError::UninstantiatedType(ty.id()));
        }
        let size = ty.layout().array_size(length)?;
        self.allocate(
            ty,
            size,
            Shape::Array {
                length: length as usize,
            },
        )
    }

    /// Allocate a hybrid with `element_count` elements whose last
    /// `overlay.len()` bytes are `overlay`.
    ///
    /// Fails with [`AllocError::InvalidLength`] if the overlay does not fit
    /// behind the array base offset.
    ///
    /// # Panics
    /// If `ty` is an instance type.
    pub fn allocate_hybrid(
        &mut self,
        ty: &TypeDescriptor,
        element_count: i32,
        overlay: &[u8],
    ) -> AllocResult<ObjectRef> {
        let layout = ty.layout();
        assert!(layout.is_array_like(), "{} is not a hybrid type", ty.name());
        if !ty.is_instantiated() {
            return Err(AllocError::UninstantiatedType(ty.id()));
        }
        let size = layout.array_size(element_count)?;
        if overlay.len() > size - layout.array_base_offset() {
            return Err(AllocError::InvalidLength(element_count));
        }
        self.allocate(
            ty,
            size,
            Shape::Hybrid {
                length: element_count as usize,
                overlay,
            },
        )
    }

    /// Shallow copy of `source`.
    ///
    /// The copy gets a header computed for its own chunk; references it
    /// holds are copied as raw bits.
    pub fn clone_object(&mut self, source: ObjectRef) -> AllocResult<ObjectRef> {
        let header = self.heap.header(source);
        let ty = self
            .heap
            .types()
            .get(header.type_id())
            .ok_or(AllocError::UninstantiatedType(header.type_id()))?;
        if !ty.is_cloneable() {
            return Err(AllocError::NotCloneable(ty.id()));
        }
        let layout = ty.layout();
        let length = if layout.is_array_like() {
            self.heap.array_length(source)
        } else {
            0
        };
        let size = layout.object_size(length);
        self.allocate(&ty, size, Shape::Clone { source, length })
    }

    /// Allocate a multi-dimensional array.
    ///
    /// `ty` is the outermost array type; each level's element type is its
    /// component type. Every dimension is checked before anything is
    /// allocated, so a negative inner dimension leaves the heap untouched.
    ///
    /// # Panics
    /// If `dimensions` is empty, or a level that has an inner dimension is
    /// not a reference array.
    pub fn allocate_multi_array(
        &mut self,
        ty: &TypeDescriptor,
        dimensions: &[i32],
    ) -> AllocResult<ObjectRef> {
        assert!(
            !dimensions.is_empty(),
            "multi-array needs at least one dimension"
        );
        if let Some(&negative) = dimensions.iter().find(|&&length| length < 0) {
            return Err(AllocError::InvalidLength(negative));
        }

        // Resolve every level's type up front as well
        let mut levels = Vec::with_capacity(dimensions.len());
        let mut current = self
            .heap
            .types()
            .get(ty.id())
            .ok_or(AllocError::UninstantiatedType(ty.id()))?;
        for depth in 0..dimensions.len() {
            if !current.is_instantiated() {
                return Err(AllocError::UninstantiatedType(current.id()));
            }
            let next = if depth + 1 < dimensions.len() {
                assert!(
                    current.layout().has_reference_elements(),
                    "{} cannot hold inner dimensions",
                    current.name()
                );
                let component = current
                    .component_type()
                    .ok_or(AllocError::UninstantiatedType(current.id()))?;
                Some(
                    self.heap
                        .types()
                        .get(component)
                        .ok_or(AllocError::UninstantiatedType(component))?,
                )
            } else {
                None
            };
            levels.push(current);
            match next {
                Some(next) => current = next,
                None => break,
            }
        }

        let lengths: Vec<usize> = dimensions.iter().map(|&length| length as usize).collect();
        self.build_dimension(&levels, &lengths)
    }

    fn build_dimension(
        &mut self,
        levels: &[Arc<TypeDescriptor>],
        lengths: &[usize],
    ) -> AllocResult<ObjectRef> {
        let ty = &levels[0];
        let length = lengths[0];
        let size = ty.layout().array_size_unchecked(length);
        let array = self.allocate(ty, size, Shape::Array { length })?;
        if lengths.len() > 1 {
            for index in 0..length {
                let inner = self.build_dimension(&levels[1..], &lengths[1..])?;
                // The outer array may be older than the inner one
                self.heap
                    .write_reference(array, ty.layout().element_offset(index), Some(inner));
            }
        }
        Ok(array)
    }

    /// Common fast path: bump the TLAB, format, or fall back
    #[inline(always)]
    fn allocate(
        &mut self,
        ty: &TypeDescriptor,
        size: usize,
        shape: Shape<'_>,
    ) -> AllocResult<ObjectRef> {
        {
            let window = if needs_unaligned_chunk(ty, size, self.large_array_threshold) {
                None
            } else {
                self.state.begin_formatting(self.heap.safepoint())
            };
            if let Some(_window) = window {
                let _scope = NoSafepointScope::enter();
                if let Some(memory) = self.tlab.bump_allocate(size) {
                    format::prefetch_allocation(self.tlab.top(), &self.params().prefetch);
                    let (remembered_set, unaligned) =
                        (self.tlab.remembered_set(), self.tlab.unaligned());
                    // SAFETY: memory was just reserved from this thread's TLAB
                    let obj = unsafe {
                        initialize(
                            memory,
                            ty,
                            size,
                            shape,
                            remembered_set,
                            unaligned,
                            self.params().max_unrolled_stores,
                        )
                    };
                    if remembered_set {
                        slow_path::dirty_fresh_object(
                            &self.heap,
                            obj,
                            ty,
                            shape.length(),
                            unaligned,
                        );
                    }
                    self.stats.fast_allocations += 1;
                    self.stats.bytes_allocated += size as u64;
                    return Ok(obj);
                }
            }
        }
        self.allocate_slow(ty, size, shape)
    }

    #[inline(never)]
    #[cold]
    fn allocate_slow(
        &mut self,
        ty: &TypeDescriptor,
        size: usize,
        shape: Shape<'_>,
    ) -> AllocResult<ObjectRef> {
        if self.state.take_flush_request() {
            // A collection claimed the TLAB
            self.retire_tlab();
        }
        let unaligned = needs_unaligned_chunk(ty, size, self.large_array_threshold);
        let obj = slow_path::allocate(
            &self.heap,
            &mut self.tlab,
            &mut self.stats,
            ty,
            size,
            shape,
            unaligned,
        )?;
        self.stats.slow_allocations += 1;
        self.stats.bytes_allocated += size as u64;
        Ok(obj)
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.retire_tlab();
        self.heap.safepoint().unregister(&self.state);
        ATTACHED.with(|attached| attached.set(false));
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("tlab", &self.tlab)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ARRAY_LENGTH_OFFSET, HEADER_SIZE};
    use crate::types::TypeSpec;

    fn heap() -> Arc<Heap> {
        Heap::new(HeapParameters::small()).unwrap()
    }

    #[test]
    fn test_one_mutator_per_thread() {
        let heap = heap();
        let mutator = heap.attach_thread().unwrap();
        assert!(heap.attach_thread().is_none());
        assert_eq!(heap.mutator_count(), 1);
        drop(mutator);
        assert_eq!(heap.mutator_count(), 0);
        assert!(heap.attach_thread().is_some());
    }

    #[test]
    fn test_first_allocation_refills_then_bumps() {
        let heap = heap();
        let point = heap.register_type(TypeSpec::instance("Point", 24));
        let mut mutator = heap.attach_thread().unwrap();

        let a = mutator.allocate_instance(&point).unwrap();
        let b = mutator.allocate_instance(&point).unwrap();
        assert_eq!(b.address(), a.address().offset(24));

        let stats = mutator.stats();
        assert_eq!(stats.slow_allocations, 1);
        assert_eq!(stats.fast_allocations, 1);
        assert_eq!(stats.tlab_refills, 1);
        assert_eq!(stats.bytes_allocated, 48);
    }

    #[test]
    fn test_uninstantiated_type_is_rejected() {
        let heap = heap();
        let ghost = heap.register_type(TypeSpec::instance("Ghost", 16).not_instantiated());
        let ghosts = heap.register_type(TypeSpec::primitive_array("Ghost[]", 8).not_instantiated());
        let mut mutator = heap.attach_thread().unwrap();
        assert_eq!(
            mutator.allocate_instance(&ghost),
            Err(AllocError::UninstantiatedType(ghost.id()))
        );
        assert_eq!(
            mutator.allocate_array(&ghosts, 4),
            Err(AllocError::UninstantiatedType(ghosts.id()))
        );
        assert_eq!(mutator.stats(), AllocStats::default());
    }

    #[test]
    #[should_panic(expected = "Point is not an array type")]
    fn test_array_of_instance_type_panics() {
        let heap = heap();
        let point = heap.register_type(TypeSpec::instance("Point", 8));
        let mut mutator = heap.attach_thread().unwrap();
        let _ = mutator.allocate_array(&point, 16);
    }

    #[test]
    #[should_panic(expected = "long[] is an array type")]
    fn test_instance_of_array_type_panics() {
        let heap = heap();
        let longs = heap.register_type(TypeSpec::primitive_array("long[]", 8));
        let mut mutator = heap.attach_thread().unwrap();
        let _ = mutator.allocate_instance(&longs);
    }

    #[test]
    #[should_panic(expected = "int[] cannot hold inner dimensions")]
    fn test_multi_array_through_primitive_level_panics() {
        let heap = heap();
        let ints = heap.register_type(TypeSpec::primitive_array("int[]", 4));
        let mut mutator = heap.attach_thread().unwrap();
        let _ = mutator.allocate_multi_array(&ints, &[2, 2]);
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let heap = heap();
        let ints = heap.register_type(TypeSpec::primitive_array("int[]", 4));
        let mut mutator = heap.attach_thread().unwrap();
        assert_eq!(
            mutator.allocate_array(&ints, -1),
            Err(AllocError::InvalidLength(-1))
        );
        assert!(mutator.tlab().is_empty());
    }

    #[test]
    fn test_array_is_tagged_and_zeroed() {
        let heap = heap();
        let longs = heap.register_type(TypeSpec::primitive_array("long[]", 8));
        let mut mutator = heap.attach_thread().unwrap();
        let array = mutator.allocate_array(&longs, 5).unwrap();

        assert_eq!(heap.array_length(array), 5);
        assert_eq!(heap.header(array).type_id(), longs.id());
        for i in 0..5 {
            assert_eq!(heap.read_word(array, longs.layout().element_offset(i)), 0);
        }
        assert_eq!(heap.object_size(array), Some(56));
    }

    #[test]
    fn test_hybrid_overlay_lands_at_the_end() {
        let heap = heap();
        let table = heap.register_type(TypeSpec::hybrid("Table", 24, 4, false));
        let mut mutator = heap.attach_thread().unwrap();
        let overlay = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let obj = mutator.allocate_hybrid(&table, 6, &overlay).unwrap();

        let size = heap.object_size(obj).unwrap();
        assert_eq!(
            heap.read_bytes(obj, size - overlay.len(), overlay.len()),
            overlay
        );
        let base = table.layout().array_base_offset();
        assert!(
            heap.read_bytes(obj, base, size - overlay.len() - base)
                .iter()
                .all(|&b| b == 0)
        );
        assert_eq!(heap.array_length(obj), 6);
    }

    #[test]
    fn test_hybrid_overlay_too_large() {
        let heap = heap();
        let table = heap.register_type(TypeSpec::hybrid("Table", 24, 4, false));
        let mut mutator = heap.attach_thread().unwrap();
        let overlay = [0xFFu8; 64];
        assert_eq!(
            mutator.allocate_hybrid(&table, 2, &overlay),
            Err(AllocError::InvalidLength(2))
        );
    }

    #[test]
    fn test_clone_instance() {
        let heap = heap();
        let pair = heap.register_type(TypeSpec::instance("Pair", 24));
        let sealed = heap.register_type(TypeSpec::instance("Sealed", 16).not_cloneable());
        let mut mutator = heap.attach_thread().unwrap();

        let original = mutator.allocate_instance(&pair).unwrap();
        heap.write_word(original, HEADER_SIZE, 7);
        heap.write_word(original, HEADER_SIZE + 8, 9);
        let copy = mutator.clone_object(original).unwrap();
        assert_ne!(copy, original);
        assert_eq!(heap.read_word(copy, HEADER_SIZE), 7);
        assert_eq!(heap.read_word(copy, HEADER_SIZE + 8), 9);
        assert_eq!(heap.header(copy), heap.header(original));

        let lonely = mutator.allocate_instance(&sealed).unwrap();
        assert_eq!(
            mutator.clone_object(lonely),
            Err(AllocError::NotCloneable(sealed.id()))
        );
    }

    #[test]
    fn test_clone_array_keeps_length_and_elements() {
        let heap = heap();
        let ints = heap.register_type(TypeSpec::primitive_array("int[]", 4));
        let mut mutator = heap.attach_thread().unwrap();
        let array = mutator.allocate_array(&ints, 3).unwrap();
        // Elements 0 and 1 share a word
        heap.write_word(
            array,
            ints.layout().element_offset(0),
            0x0000_0002_0000_0001,
        );

        let copy = mutator.clone_object(array).unwrap();
        assert_eq!(heap.array_length(copy), 3);
        assert_eq!(
            heap.read_word(copy, ints.layout().element_offset(0)),
            0x0000_0002_0000_0001
        );
        assert_eq!(
            heap.read_bytes(copy, ARRAY_LENGTH_OFFSET, 4),
            3u32.to_ne_bytes().to_vec()
        );
    }

    #[test]
    fn test_multi_array() {
        let heap = heap();
        let ints = heap.register_type(TypeSpec::primitive_array("int[]", 4));
        let matrix = heap.register_type(TypeSpec::reference_array("int[][]", Some(ints.id())));
        let mut mutator = heap.attach_thread().unwrap();

        let outer = mutator.allocate_multi_array(&matrix, &[3, 4]).unwrap();
        assert_eq!(heap.array_length(outer), 3);
        let mut rows = Vec::new();
        for i in 0..3 {
            let row = heap
                .read_reference(outer, matrix.layout().element_offset(i))
                .unwrap();
            assert_eq!(heap.array_length(row), 4);
            assert_eq!(heap.header(row).type_id(), ints.id());
            rows.push(row);
        }
        rows.dedup();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_multi_array_negative_inner_allocates_nothing() {
        let heap = heap();
        let ints = heap.register_type(TypeSpec::primitive_array("int[]", 4));
        let matrix = heap.register_type(TypeSpec::reference_array("int[][]", Some(ints.id())));
        let mut mutator = heap.attach_thread().unwrap();

        assert_eq!(
            mutator.allocate_multi_array(&matrix, &[2, -3]),
            Err(AllocError::InvalidLength(-3))
        );
        assert_eq!(mutator.stats(), AllocStats::default());
        assert!(mutator.tlab().is_empty());
    }

    #[test]
    fn test_drop_retires_tlab() {
        let space =
            Arc::new(crate::space::GenerationalSpace::new(&HeapParameters::small()).unwrap());
        let owner = Heap::with_collector(HeapParameters::small(), space.clone()).unwrap();
        let point = owner.register_type(TypeSpec::instance("Point", 24));
        let mut mutator = owner.attach_thread().unwrap();
        mutator.allocate_instance(&point).unwrap();
        drop(mutator);
        assert_eq!(space.stats().retired_tlab_bytes, space.chunk_size() - 24);
    }
}
