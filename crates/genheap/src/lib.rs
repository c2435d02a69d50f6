//! # genheap
//!
//! Allocation fast path and card-table write barrier for a generational heap.
//!
//! ## Design
//!
//! - **TLAB allocation**: each mutator thread bumps a private cursor, no
//!   synchronization on the fast path
//! - **Formatting**: header word, array length and zeroed payload are written
//!   before an object becomes visible, inside a no-safepoint region
//! - **Large arrays**: placed in unaligned chunks through the slow path
//! - **Remembered set**: a byte-per-card table; aligned objects are marked by
//!   their start, unaligned ones by the written address
//! - **Slow path**: the single handoff point to the collector, the only place
//!   allocation may block; it runs on a grown stack when the thread is short
//! - **Safepoints**: collections wait until no mutator is formatting an
//!   object, and every TLAB is retired before its owner allocates again
//!
//! ## Example
//!
//! ```
//! use genheap::{Heap, HeapParameters, TypeSpec};
//!
//! let heap = Heap::new(HeapParameters::small()).unwrap();
//! let ints = heap.register_type(TypeSpec::primitive_array("int[]", 4));
//! let mut mutator = heap.attach_thread().unwrap();
//!
//! let array = mutator.allocate_array(&ints, 10).unwrap();
//! assert_eq!(heap.array_length(array), 10);
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocator;
pub mod barrier;
pub mod card_table;
pub mod config;
pub mod error;
pub mod format;
pub mod heap;
pub mod layout;
pub mod object;
pub mod safepoint;
mod slow_path;
pub mod space;
pub mod tlab;
pub mod types;

pub use allocator::{AllocStats, Mutator};
pub use card_table::{CARD_SIZE, CardState, CardTable};
pub use config::{HeapParameters, PrefetchParameters};
pub use error::{AllocError, AllocResult, ConfigError};
pub use heap::Heap;
pub use layout::{LayoutEncoding, LayoutKind};
pub use object::{Address, ObjectHeader, ObjectRef};
pub use space::{
    ChunkKind, CollectionCause, CollectionWatcher, Collector, GenerationalSpace, Generation,
    MemoryRequest, Placement, SpaceStats,
};
pub use tlab::Tlab;
pub use types::{TypeDescriptor, TypeId, TypeRegistry, TypeSpec};
