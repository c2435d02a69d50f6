//! Shared heap state
//!
//! One [`Heap`] per process (or per isolate): the type registry, the
//! collector, the card table covering the collector's arena, and the field
//! access paths that run the write barrier. Mutator threads attach to it
//! with [`Heap::attach_thread`].

use std::ptr;
use std::sync::Arc;

use crate::allocator::Mutator;
use crate::barrier;
use crate::card_table::CardTable;
use crate::config::HeapParameters;
use crate::error::ConfigError;
use crate::format;
use crate::layout::{LayoutEncoding, REFERENCE_SIZE, WORD_SIZE};
use crate::object::{Address, ObjectHeader, ObjectRef};
use crate::safepoint::{self, Safepoint};
use crate::space::{CollectionCause, Collector, GenerationalSpace};
use crate::types::{TypeDescriptor, TypeRegistry, TypeSpec};

/// Main heap - shared between threads
pub struct Heap {
    params: HeapParameters,
    types: TypeRegistry,
    collector: Arc<dyn Collector>,
    cards: CardTable,
    /// Attached mutators and the collection gate
    safepoint: Safepoint,
}

impl Heap {
    /// Create a heap backed by a [`GenerationalSpace`]
    pub fn new(params: HeapParameters) -> Result<Arc<Self>, ConfigError> {
        let space = GenerationalSpace::new(&params)?;
        Self::with_collector(params, Arc::new(space))
    }

    /// Create a heap on top of an arbitrary collector
    pub fn with_collector(
        params: HeapParameters,
        collector: Arc<dyn Collector>,
    ) -> Result<Arc<Self>, ConfigError> {
        params.validate()?;
        let (base, size) = collector.reserved();
        Ok(Arc::new(Self {
            cards: CardTable::new(base, size),
            types: TypeRegistry::new(),
            collector,
            params,
            safepoint: Safepoint::new(),
        }))
    }

    /// Heap parameters
    pub fn params(&self) -> &HeapParameters {
        &self.params
    }

    /// Type registry
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Register a type
    pub fn register_type(&self, spec: TypeSpec) -> Arc<TypeDescriptor> {
        self.types.register(spec)
    }

    /// The collector
    pub fn collector(&self) -> &dyn Collector {
        &*self.collector
    }

    /// The card table
    pub fn card_table(&self) -> &CardTable {
        &self.cards
    }

    pub(crate) fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    /// Run a collection now.
    ///
    /// Waits until no mutator is formatting an object; every mutator then
    /// retires its TLAB before it allocates again. Must not be called while
    /// the thread is inside a no-safepoint region.
    pub fn collect(&self) {
        let epoch = self.collector.collection_epoch();
        safepoint::with_stack_headroom(&self.params, || {
            self.collect_after(CollectionCause::Explicit, epoch)
        });
    }

    /// Collect at a safepoint unless a collection completed since
    /// `observed_epoch`
    pub(crate) fn collect_after(&self, cause: CollectionCause, observed_epoch: u64) {
        if self.collector.collection_epoch() > observed_epoch {
            return;
        }
        self.safepoint
            .stop_mutators(|| self.collector.collect(cause, observed_epoch));
    }

    /// Attach the calling thread as a mutator.
    ///
    /// Returns `None` if the thread already owns a mutator.
    pub fn attach_thread(self: &Arc<Self>) -> Option<Mutator> {
        Mutator::attach(Arc::clone(self))
    }

    /// Number of attached mutators
    pub fn mutator_count(&self) -> usize {
        self.safepoint.mutator_count()
    }

    /// True if `addr` lies in the heap arena
    pub fn contains(&self, addr: Address) -> bool {
        self.cards.covers(addr)
    }

    /// Address of `[offset, offset + len)` inside `obj`, checked against the
    /// arena so raw accesses never leave heap memory
    #[inline]
    fn checked(&self, obj: ObjectRef, offset: usize, len: usize) -> Address {
        let start = obj.address().offset(offset);
        assert!(
            len > 0 && self.cards.covers(start) && self.cards.covers(start.offset(len - 1)),
            "access [{start}, +{len}) outside the heap"
        );
        start
    }

    /// Header word of `obj`
    pub fn header(&self, obj: ObjectRef) -> ObjectHeader {
        self.checked(obj, 0, WORD_SIZE);
        // SAFETY: in-arena and word aligned
        unsafe { format::read_header(obj) }
    }

    /// Type of `obj`
    pub fn type_of(&self, obj: ObjectRef) -> Option<Arc<TypeDescriptor>> {
        self.types.get(self.header(obj).type_id())
    }

    /// Length of an array or hybrid
    pub fn array_length(&self, obj: ObjectRef) -> usize {
        self.checked(obj, 0, WORD_SIZE + 4);
        // SAFETY: in-arena
        unsafe { format::read_length(obj) }
    }

    /// Total size of `obj` in bytes
    pub fn object_size(&self, obj: ObjectRef) -> Option<usize> {
        let ty = self.type_of(obj)?;
        let layout = ty.layout();
        let length = if layout.is_array_like() {
            self.array_length(obj)
        } else {
            0
        };
        Some(layout.object_size(length))
    }

    /// Read a word field (primitive or raw)
    pub fn read_word(&self, obj: ObjectRef, offset: usize) -> u64 {
        let addr = self.checked(obj, offset, WORD_SIZE);
        // SAFETY: in-arena; unaligned reads are allowed
        unsafe { addr.as_mut_ptr::<u64>().read_unaligned() }
    }

    /// Write a primitive word field. No barrier.
    pub fn write_word(&self, obj: ObjectRef, offset: usize, value: u64) {
        let addr = self.checked(obj, offset, WORD_SIZE);
        // SAFETY: in-arena
        unsafe { addr.as_mut_ptr::<u64>().write_unaligned(value) }
    }

    /// Copy `len` bytes starting at `offset` out of `obj`
    pub fn read_bytes(&self, obj: ObjectRef, offset: usize, len: usize) -> Vec<u8> {
        if len == 0 {
            return Vec::new();
        }
        let addr = self.checked(obj, offset, len);
        let mut bytes = vec![0u8; len];
        // SAFETY: in-arena source, fresh destination
        unsafe { ptr::copy_nonoverlapping(addr.as_mut_ptr::<u8>(), bytes.as_mut_ptr(), len) };
        bytes
    }

    /// Read a reference field
    pub fn read_reference(&self, obj: ObjectRef, offset: usize) -> Option<ObjectRef> {
        ObjectRef::from_slot(self.read_word(obj, offset))
    }

    /// Store a reference field, then run the write barrier
    pub fn write_reference(&self, obj: ObjectRef, offset: usize, value: Option<ObjectRef>) {
        let addr = self.checked(obj, offset, REFERENCE_SIZE);
        // SAFETY: in-arena
        unsafe { addr.as_mut_ptr::<u64>().write_unaligned(ObjectRef::to_slot(value)) };
        self.write_barrier(obj, addr);
    }

    /// True if stores into `obj` need card marking
    #[inline]
    pub fn needs_barrier(&self, obj: ObjectRef) -> bool {
        self.header(obj).has_remembered_set()
    }

    /// Barrier after a single reference store at `write` inside `obj`
    #[inline]
    pub fn write_barrier(&self, obj: ObjectRef, write: Address) {
        let header = self.header(obj);
        if self.params.outline_barriers {
            barrier::post_write_outlined(&self.cards, obj, header, write);
        } else {
            barrier::post_write_inline(&self.cards, obj, header, write);
        }
    }

    /// Barrier after a bulk reference store into `[start, end)` inside `obj`.
    /// An empty range does nothing.
    pub fn write_barrier_range(&self, obj: ObjectRef, start: Address, end: Address) {
        if start >= end {
            return;
        }
        barrier::post_write_range(&self.cards, obj, self.header(obj), start, end);
    }

    /// Copy `count` elements between reference arrays, then dirty the
    /// destination range once. Overlapping ranges are allowed.
    pub fn copy_references(
        &self,
        src: ObjectRef,
        src_index: usize,
        dst: ObjectRef,
        dst_index: usize,
        count: usize,
    ) {
        let src_layout = self.reference_array_layout(src);
        let dst_layout = self.reference_array_layout(dst);
        assert!(
            src_index + count <= self.array_length(src)
                && dst_index + count <= self.array_length(dst),
            "reference copy out of bounds"
        );
        if count == 0 {
            return;
        }
        let bytes = count * REFERENCE_SIZE;
        let from = self.checked(src, src_layout.element_offset(src_index), bytes);
        let to = self.checked(dst, dst_layout.element_offset(dst_index), bytes);
        // SAFETY: both ranges in-arena and bounds checked
        unsafe { ptr::copy(from.as_mut_ptr::<u8>(), to.as_mut_ptr::<u8>(), bytes) };
        self.write_barrier_range(dst, to, to.offset(bytes));
    }

    fn reference_array_layout(&self, obj: ObjectRef) -> LayoutEncoding {
        let layout = self
            .type_of(obj)
            .map(|ty| ty.layout())
            .filter(|layout| layout.has_reference_elements());
        match layout {
            Some(layout) => layout,
            None => panic!("{obj:?} is not a reference array"),
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("params", &self.params)
            .field("types", &self.types.len())
            .field("mutators", &self.mutator_count())
            .finish_non_exhaustive()
    }
}
