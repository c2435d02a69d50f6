//! Allocation error types

use crate::types::TypeId;
use thiserror::Error;

/// Errors that cross the allocator boundary.
///
/// A failed bump allocation is not one of these: TLAB exhaustion and
/// large-array routing are resolved inside the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The type system never registered the type as instantiable
    #[error("type {0} is not instantiated")]
    UninstantiatedType(TypeId),

    /// Negative array or dimension length
    #[error("invalid array length: {0}")]
    InvalidLength(i32),

    /// Clone requested on a type without clone support
    #[error("type {0} is not cloneable")]
    NotCloneable(TypeId),

    /// The collector could not provide memory even after collecting
    #[error("out of memory (requested {requested} bytes)")]
    OutOfMemory {
        /// Size of the request that failed
        requested: usize,
    },
}

/// Result type for allocation operations
pub type AllocResult<T> = Result<T, AllocError>;

/// Rejected heap parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Aligned chunk size is not a power of two multiple of the card size
    #[error("aligned chunk size {0} must be a power of two and a multiple of the card size")]
    ChunkSize(usize),

    /// Large array threshold does not fit into an aligned chunk
    #[error("large array threshold {threshold} exceeds aligned chunk size {chunk_size}")]
    LargeArrayThreshold {
        /// Configured threshold
        threshold: usize,
        /// Configured chunk size
        chunk_size: usize,
    },

    /// Young generation budget larger than the heap itself
    #[error("young capacity {young} exceeds heap capacity {heap}")]
    YoungCapacity {
        /// Configured young capacity
        young: usize,
        /// Configured heap capacity
        heap: usize,
    },

    /// Heap cannot hold even one aligned chunk
    #[error("heap capacity {0} is smaller than one aligned chunk")]
    HeapCapacity(usize),

    /// Prefetching enabled with a zero step
    #[error("prefetch step must be nonzero when prefetch lines are enabled")]
    PrefetchStep,

    /// Collector stack segment no larger than the red zone that triggers it
    #[error("collector stack size {stack_size} must exceed its red zone {red_zone}")]
    CollectorStack {
        /// Configured red zone
        red_zone: usize,
        /// Configured segment size
        stack_size: usize,
    },

    /// The heap arena could not be reserved
    #[error("could not reserve a heap arena of {0} bytes")]
    Reservation(usize),
}
