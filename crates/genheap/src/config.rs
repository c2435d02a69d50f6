//! Heap parameters

use crate::card_table::CARD_SIZE;
use crate::error::ConfigError;

/// Allocation prefetch tuning.
///
/// After a successful bump allocation the allocator prefetches `lines`
/// cache lines, `step` bytes apart, starting `distance` bytes past the new
/// TLAB top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchParameters {
    /// Bytes beyond the new top where prefetching starts
    pub distance: usize,
    /// Number of lines to prefetch (0 disables prefetching)
    pub lines: usize,
    /// Bytes between prefetched lines
    pub step: usize,
}

impl PrefetchParameters {
    /// No prefetching
    pub const DISABLED: Self = Self {
        distance: 0,
        lines: 0,
        step: 0,
    };

    /// True if any line is prefetched
    #[inline(always)]
    pub const fn is_enabled(&self) -> bool {
        self.lines != 0
    }
}

impl Default for PrefetchParameters {
    fn default() -> Self {
        Self {
            distance: 192,
            lines: 4,
            step: 64,
        }
    }
}

/// Heap configuration
#[derive(Debug, Clone)]
pub struct HeapParameters {
    /// Bytes reserved for the heap arena (default: 64MB)
    pub heap_capacity: usize,
    /// Aligned-chunk budget handed out as TLABs (default: 8MB)
    pub young_capacity: usize,
    /// Size and alignment of aligned chunks, also the TLAB size (default: 1MB)
    pub aligned_chunk_size: usize,
    /// Arrays above this size go to unaligned chunks (default: 128KB)
    pub large_array_threshold: usize,
    /// Allocation prefetch
    pub prefetch: PrefetchParameters,
    /// Longest zeroing sequence emitted as straight-line stores (default: 8)
    pub max_unrolled_stores: usize,
    /// Share barrier marking logic out of line instead of inlining it
    pub outline_barriers: bool,
    /// Collector handoffs with less stack left than this run on a fresh
    /// stack segment (default: 1MB)
    pub collector_stack_red_zone: usize,
    /// Size of that segment (default: 16MB)
    pub collector_stack_size: usize,
}

impl Default for HeapParameters {
    fn default() -> Self {
        Self {
            heap_capacity: 64 * 1024 * 1024,      // 64MB
            young_capacity: 8 * 1024 * 1024,      // 8MB
            aligned_chunk_size: 1024 * 1024,      // 1MB
            large_array_threshold: 128 * 1024,    // 128KB
            prefetch: PrefetchParameters::default(),
            max_unrolled_stores: 8,
            outline_barriers: false,
            collector_stack_red_zone: 1024 * 1024, // 1MB
            collector_stack_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl HeapParameters {
    /// Small heap for tests: 4MB arena, 64KB chunks, 1MB young budget
    pub fn small() -> Self {
        Self {
            heap_capacity: 4 * 1024 * 1024,
            young_capacity: 1024 * 1024,
            aligned_chunk_size: 64 * 1024,
            large_array_threshold: 16 * 1024,
            ..Self::default()
        }
    }

    /// Check that the parameters describe a usable heap
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk = self.aligned_chunk_size;
        if !chunk.is_power_of_two() || chunk < CARD_SIZE {
            return Err(ConfigError::ChunkSize(chunk));
        }
        if self.large_array_threshold > chunk {
            return Err(ConfigError::LargeArrayThreshold {
                threshold: self.large_array_threshold,
                chunk_size: chunk,
            });
        }
        if self.heap_capacity < chunk {
            return Err(ConfigError::HeapCapacity(self.heap_capacity));
        }
        if self.young_capacity > self.heap_capacity {
            return Err(ConfigError::YoungCapacity {
                young: self.young_capacity,
                heap: self.heap_capacity,
            });
        }
        if self.prefetch.is_enabled() && self.prefetch.step == 0 {
            return Err(ConfigError::PrefetchStep);
        }
        if self.collector_stack_size <= self.collector_stack_red_zone {
            return Err(ConfigError::CollectorStack {
                red_zone: self.collector_stack_red_zone,
                stack_size: self.collector_stack_size,
            });
        }
        Ok(())
    }
}
