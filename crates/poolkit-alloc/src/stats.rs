//! Atomic allocator statistics for lock-free usage tracking.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Snapshot of allocator usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Blocks served from a free list.
    pub hits: u64,
    /// Blocks mapped fresh from the system.
    pub misses: u64,
    /// Blocks unmapped on free because the free budget was full.
    pub evictions: u64,
    /// Bytes currently handed out to pools.
    pub allocated_bytes: usize,
    /// Bytes currently cached in free lists.
    pub cached_bytes: usize,
}

/// Atomic allocator statistics for lock-free updates.
pub struct AtomicAllocatorStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    allocated: AtomicUsize,
}

impl AtomicAllocatorStats {
    /// Create new zeroed stats.
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Take a snapshot; `cached_bytes` comes from the caller's locked view.
    pub fn snapshot(&self, cached_bytes: usize) -> AllocatorStats {
        AllocatorStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            allocated_bytes: self.allocated.load(Ordering::Relaxed),
            cached_bytes,
        }
    }

    /// Reset the event counters. Byte gauges are left alone.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Record a block handed out from a free list.
    pub fn record_hit(&self, bytes: usize) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a block mapped fresh.
    pub fn record_miss(&self, bytes: usize) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a block coming back from a pool.
    pub fn record_return(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Record a block unmapped instead of cached.
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes currently handed out.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Default for AtomicAllocatorStats {
    fn default() -> Self {
        Self::new()
    }
}
