//! Collector handoff and chunked heap space
//!
//! The allocator never manages chunks itself. Whenever the fast path cannot
//! satisfy a request it asks a [`Collector`] for memory: a fresh TLAB, room
//! for one small object, or an unaligned chunk for one large array. When the
//! collector has nothing left, the slow path stops the mutators, has the
//! collector collect, and asks once more. That is the only place allocation
//! can block.
//!
//! [`GenerationalSpace`] is the in-crate collector. It reserves one arena and
//! carves it from both ends:
//!
//! ```text
//! base                                                        base + capacity
//! ┌─────────┬─────────┬─────────┬──────────────┬──────────┬───────────────┐
//! │ young   │ young   │ old     │   (free)     │ unaligned│ unaligned     │
//! │ aligned │ aligned │ aligned │              │ chunk    │ chunk         │
//! └─────────┴─────────┴─────────┴──────────────┴──────────┴───────────────┘
//!   aligned chunks grow up  ──▶            ◀── unaligned chunks grow down
//! ```
//!
//! It never reclaims memory: a collection advances the epoch and notifies
//! watchers, and the real mark/compact work is left to an embedding
//! collector implementing [`Collector`].

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};

use crate::config::HeapParameters;
use crate::error::ConfigError;
use crate::layout::{OBJECT_ALIGNMENT, align_up};
use crate::object::Address;
use crate::safepoint;

/// Granularity of unaligned chunks
pub const PAGE_SIZE: usize = 4096;

/// Kind of chunk an allocation was placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Many small objects packed together
    Aligned,
    /// A single large object
    Unaligned,
}

/// Generation of the chunk an allocation was placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Young (eden) memory
    Young,
    /// Old memory
    Old,
}

/// What the allocator asks the collector for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRequest {
    /// A fresh thread-local allocation buffer
    Tlab,
    /// Room for one object of `size` bytes, in its own unaligned chunk if
    /// `unaligned` is set
    Object {
        /// Object size, already rounded to the allocation granularity
        size: usize,
        /// Place the object in an unaligned chunk
        unaligned: bool,
    },
}

impl MemoryRequest {
    /// Bytes requested (0 for a TLAB, whose size the collector chooses)
    pub fn size(&self) -> usize {
        match *self {
            MemoryRequest::Tlab => 0,
            MemoryRequest::Object { size, .. } => size,
        }
    }
}

/// Memory handed out by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// First byte
    pub start: Address,
    /// Exclusive end
    pub end: Address,
    /// Chunk kind
    pub kind: ChunkKind,
    /// Chunk generation
    pub generation: Generation,
}

impl Placement {
    /// True unless the memory is guaranteed young. Objects placed here get
    /// the remembered-set bit.
    #[inline]
    pub fn remembered_set(&self) -> bool {
        !(self.kind == ChunkKind::Aligned && self.generation == Generation::Young)
    }

    /// True for unaligned chunks
    #[inline]
    pub fn unaligned(&self) -> bool {
        self.kind == ChunkKind::Unaligned
    }

    /// Placement size in bytes
    pub fn len(&self) -> usize {
        self.end.offset_from(self.start)
    }

    /// True for an empty placement
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Why a collection was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionCause {
    /// A slow-path request could not be satisfied
    AllocationFailure,
    /// Requested by the embedder
    Explicit,
}

/// Callbacks around each collection
pub trait CollectionWatcher: Send + Sync {
    /// Called before the collection for `epoch` starts
    fn before_collection(&self, _epoch: u64, _cause: CollectionCause) {}

    /// Called after the collection for `epoch` finished
    fn after_collection(&self, _epoch: u64, _cause: CollectionCause) {}
}

/// The collector as seen by the allocator.
///
/// Called only from the slow path and [`Heap::collect`](crate::Heap::collect),
/// never while the calling thread holds a
/// [`NoSafepointScope`](crate::safepoint::NoSafepointScope).
pub trait Collector: Send + Sync {
    /// Address range the card table must cover
    fn reserved(&self) -> (Address, usize);

    /// Arrays above this size are never allocated from a TLAB
    fn large_array_threshold(&self) -> usize;

    /// Provide memory for `request` without collecting.
    ///
    /// `None` means no memory is left. For a TLAB the caller falls back to
    /// an individual placement; otherwise it collects and asks again.
    /// A TLAB placement may be old: objects bumped from it carry the
    /// placement's header bits.
    fn obtain_memory(&self, request: MemoryRequest) -> Option<Placement>;

    /// Take back the unused remainder `[start, end)` of a retired TLAB
    fn retire_tlab(&self, start: Address, end: Address);

    /// Number of completed collections
    fn collection_epoch(&self) -> u64;

    /// Run a collection unless one completed since `observed_epoch`.
    ///
    /// The heap calls this with every mutator stopped outside its
    /// formatting window.
    fn collect(&self, cause: CollectionCause, observed_epoch: u64);
}

/// Accounting snapshot for a [`GenerationalSpace`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SpaceStats {
    /// Completed collections
    pub collections: u64,
    /// Bytes of young aligned chunks handed out as TLABs
    pub young_chunk_bytes: usize,
    /// Bytes of old aligned chunks
    pub old_chunk_bytes: usize,
    /// Bytes of unaligned chunks
    pub unaligned_chunk_bytes: usize,
    /// TLAB remainders given back unused, plus old-chunk tails too small
    /// for the next object
    pub retired_tlab_bytes: usize,
    /// Bytes handed out since the last collection
    pub bytes_allocated_since_collection: usize,
}

/// The reserved heap memory
struct Arena {
    base: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    fn reserve(capacity: usize, align: usize) -> Option<Self> {
        let layout = Layout::from_size_align(capacity, align).ok()?;
        // SAFETY: layout has nonzero size (validated by HeapParameters)
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        // Expose provenance so Address::as_mut_ptr can reach any arena byte
        let _ = base.as_ptr().expose_provenance();
        Some(Self { base, layout })
    }

    fn start(&self) -> Address {
        Address::from_usize(self.base.as_ptr().addr())
    }

    fn capacity(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: allocated in reserve() with the same layout
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

// Safety: the arena is plain memory; access is coordinated by the space and
// by per-thread TLAB ownership
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

/// Chunk bookkeeping, protected by the space lock
struct ChunkLists {
    /// Next free byte for aligned chunks (grows up)
    low: usize,
    /// Lowest byte used by unaligned chunks (grows down)
    high: usize,
    young: Vec<Address>,
    old: Vec<Address>,
    unaligned: Vec<(Address, usize)>,
    /// Bump window in the current old chunk
    old_top: Address,
    old_end: Address,
    retired_tlab_bytes: usize,
}

/// Arena-backed stand-in collector.
///
/// Young aligned chunks become TLABs until the young budget is spent; after
/// that, small objects are placed one by one in old aligned chunks. Large
/// arrays always get their own unaligned chunk.
pub struct GenerationalSpace {
    arena: Arena,
    chunk_size: usize,
    young_budget: usize,
    large_array_threshold: usize,
    chunks: Mutex<ChunkLists>,
    /// Serializes collections
    collection_lock: Mutex<()>,
    epoch: CachePadded<AtomicU64>,
    allocated_since_collection: CachePadded<AtomicUsize>,
    watchers: RwLock<Vec<Arc<dyn CollectionWatcher>>>,
}

impl GenerationalSpace {
    /// Reserve a space for the given parameters
    pub fn new(params: &HeapParameters) -> Result<Self, ConfigError> {
        params.validate()?;
        let capacity = align_up(params.heap_capacity, PAGE_SIZE);
        let arena = Arena::reserve(capacity, params.aligned_chunk_size)
            .ok_or(ConfigError::Reservation(capacity))?;
        let base = arena.start().as_usize();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "genheap::space",
            base = format_args!("{base:#x}"),
            capacity,
            chunk_size = params.aligned_chunk_size,
            "Heap arena reserved"
        );

        Ok(Self {
            chunk_size: params.aligned_chunk_size,
            young_budget: params.young_capacity / params.aligned_chunk_size,
            large_array_threshold: params.large_array_threshold,
            chunks: Mutex::new(ChunkLists {
                low: base,
                high: base + capacity,
                young: Vec::new(),
                old: Vec::new(),
                unaligned: Vec::new(),
                old_top: Address::NULL,
                old_end: Address::NULL,
                retired_tlab_bytes: 0,
            }),
            arena,
            collection_lock: Mutex::new(()),
            epoch: CachePadded::new(AtomicU64::new(0)),
            allocated_since_collection: CachePadded::new(AtomicUsize::new(0)),
            watchers: RwLock::new(Vec::new()),
        })
    }

    /// Size of aligned chunks
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Register a collection watcher
    pub fn register_watcher(&self, watcher: Arc<dyn CollectionWatcher>) {
        self.watchers.write().push(watcher);
    }

    /// Accounting snapshot
    pub fn stats(&self) -> SpaceStats {
        let chunks = self.chunks.lock();
        SpaceStats {
            collections: self.epoch.load(Ordering::Acquire),
            young_chunk_bytes: chunks.young.len() * self.chunk_size,
            old_chunk_bytes: chunks.old.len() * self.chunk_size,
            unaligned_chunk_bytes: chunks.unaligned.iter().map(|&(_, len)| len).sum(),
            retired_tlab_bytes: chunks.retired_tlab_bytes,
            bytes_allocated_since_collection: self
                .allocated_since_collection
                .load(Ordering::Relaxed),
        }
    }

    /// Kind and generation of the chunk containing `addr`, if any
    pub fn chunk_of(&self, addr: Address) -> Option<(ChunkKind, Generation)> {
        let chunks = self.chunks.lock();
        let aligned_start = Address::from_usize(addr.as_usize() & !(self.chunk_size - 1));
        if chunks.young.contains(&aligned_start) {
            return Some((ChunkKind::Aligned, Generation::Young));
        }
        if chunks.old.contains(&aligned_start) {
            return Some((ChunkKind::Aligned, Generation::Old));
        }
        chunks
            .unaligned
            .iter()
            .any(|&(start, len)| addr >= start && addr < start.offset(len))
            .then_some((ChunkKind::Unaligned, Generation::Old))
    }

    /// Carve one aligned chunk from the low end
    fn carve_aligned(&self, chunks: &mut ChunkLists) -> Option<Address> {
        if chunks.high - chunks.low < self.chunk_size {
            return None;
        }
        let start = Address::from_usize(chunks.low);
        chunks.low += self.chunk_size;
        Some(start)
    }

    /// Carve an unaligned chunk of at least `size` bytes from the high end
    fn carve_unaligned(&self, chunks: &mut ChunkLists, size: usize) -> Option<(Address, usize)> {
        let len = align_up(size, PAGE_SIZE);
        if chunks.high - chunks.low < len {
            return None;
        }
        chunks.high -= len;
        Some((Address::from_usize(chunks.high), len))
    }

    fn try_obtain(&self, request: MemoryRequest) -> Option<Placement> {
        let mut chunks = self.chunks.lock();
        match request {
            MemoryRequest::Tlab => {
                if chunks.young.len() >= self.young_budget {
                    return None;
                }
                let start = self.carve_aligned(&mut chunks)?;
                chunks.young.push(start);
                self.allocated_since_collection
                    .fetch_add(self.chunk_size, Ordering::Relaxed);

                #[cfg(feature = "gc_logging")]
                tracing::debug!(
                    target: "genheap::space",
                    chunk = %start,
                    young_chunks = chunks.young.len(),
                    "Young chunk handed out as TLAB"
                );

                Some(Placement {
                    start,
                    end: start.offset(self.chunk_size),
                    kind: ChunkKind::Aligned,
                    generation: Generation::Young,
                })
            }
            MemoryRequest::Object {
                size,
                unaligned: true,
            } => {
                let (start, len) = self.carve_unaligned(&mut chunks, size)?;
                chunks.unaligned.push((start, len));
                self.allocated_since_collection
                    .fetch_add(len, Ordering::Relaxed);

                #[cfg(feature = "gc_logging")]
                tracing::debug!(
                    target: "genheap::space",
                    chunk = %start,
                    size,
                    "Unaligned chunk allocated"
                );

                Some(Placement {
                    start,
                    end: start.offset(size),
                    kind: ChunkKind::Unaligned,
                    generation: Generation::Old,
                })
            }
            MemoryRequest::Object {
                size,
                unaligned: false,
            } => {
                debug_assert!(size.is_multiple_of(OBJECT_ALIGNMENT));
                if size > self.chunk_size {
                    return None;
                }
                if chunks.old_end.offset_from(chunks.old_top) < size {
                    let start = self.carve_aligned(&mut chunks)?;
                    let waste = chunks.old_end.offset_from(chunks.old_top);
                    chunks.retired_tlab_bytes += waste;
                    chunks.old.push(start);
                    chunks.old_top = start;
                    chunks.old_end = start.offset(self.chunk_size);
                }
                let start = chunks.old_top;
                chunks.old_top = start.offset(size);
                self.allocated_since_collection
                    .fetch_add(size, Ordering::Relaxed);
                Some(Placement {
                    start,
                    end: start.offset(size),
                    kind: ChunkKind::Aligned,
                    generation: Generation::Old,
                })
            }
        }
    }
}

impl Collector for GenerationalSpace {
    fn reserved(&self) -> (Address, usize) {
        (self.arena.start(), self.arena.capacity())
    }

    fn large_array_threshold(&self) -> usize {
        self.large_array_threshold
    }

    fn obtain_memory(&self, request: MemoryRequest) -> Option<Placement> {
        self.try_obtain(request)
    }

    fn retire_tlab(&self, start: Address, end: Address) {
        self.chunks.lock().retired_tlab_bytes += end.offset_from(start);
    }

    fn collection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn collect(&self, cause: CollectionCause, observed_epoch: u64) {
        debug_assert!(
            safepoint::safepoint_allowed(),
            "collection requested inside a no-safepoint region"
        );
        let _guard = self.collection_lock.lock();

        // Another thread collected while this one waited
        if self.collection_epoch() > observed_epoch {
            return;
        }

        let epoch = observed_epoch + 1;
        let watchers = self.watchers.read().clone();
        for watcher in &watchers {
            watcher.before_collection(epoch, cause);
        }

        #[cfg(feature = "gc_logging")]
        let allocated = self.allocated_since_collection.load(Ordering::Relaxed);

        self.allocated_since_collection.store(0, Ordering::Relaxed);
        self.epoch.store(epoch, Ordering::Release);

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "genheap::space",
            epoch,
            ?cause,
            allocated_since_last = allocated,
            "Collection complete"
        );

        for watcher in &watchers {
            watcher.after_collection(epoch, cause);
        }
    }
}
