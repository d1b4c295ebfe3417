//! Shared block allocator with size-class free lists.
//!
//! Bucket `i` (for `1 <= i <= max_index`) caches blocks of `boundary << i`
//! bytes, so a request maps to the bucket `ceil(log2(size / boundary))`.
//! Bucket 0 is the sink for blocks too large for any bucket; it is searched
//! first-fit. Free-list mutation is serialized by one lock, byte counters
//! are atomics, so any number of pools may share one allocator.

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::block::Block;
use crate::config::{AllocatorConfig, UNLIMITED_FREE};
use crate::error::AllocError;
use crate::stats::{AllocatorStats, AtomicAllocatorStats};

/// Index of the sink bucket for oversize blocks.
pub const SINK_INDEX: usize = 0;

struct FreeLists {
    buckets: Vec<Vec<Block>>,
    /// Highest non-empty sized bucket; bounds the search.
    max_index_used: usize,
    current_free: usize,
    max_free: usize,
}

impl FreeLists {
    fn take_sized(&mut self, index: usize) -> Option<Block> {
        if index > self.max_index_used {
            return None;
        }
        for i in index..=self.max_index_used {
            if let Some(block) = self.buckets[i].pop() {
                if i == self.max_index_used && self.buckets[i].is_empty() {
                    self.recompute_max_index();
                }
                self.current_free -= block.size();
                return Some(block);
            }
        }
        None
    }

    fn take_sink(&mut self, size: usize) -> Option<Block> {
        let sink = &mut self.buckets[SINK_INDEX];
        let pos = sink.iter().position(|b| b.size() >= size)?;
        let block = sink.swap_remove(pos);
        self.current_free -= block.size();
        Some(block)
    }

    fn recompute_max_index(&mut self) {
        self.max_index_used = (1..self.buckets.len())
            .rev()
            .find(|&i| !self.buckets[i].is_empty())
            .unwrap_or(0);
    }

    fn over_budget(&self, extra: usize) -> bool {
        self.max_free != UNLIMITED_FREE && self.current_free + extra > self.max_free
    }

    fn push(&mut self, block: Block) {
        let index = block.index();
        self.current_free += block.size();
        if index != SINK_INDEX && index > self.max_index_used {
            self.max_index_used = index;
        }
        self.buckets[index].push(block);
    }

    /// Drop cached blocks, largest classes first, until within budget.
    fn trim(&mut self) -> Vec<Block> {
        let mut evicted = Vec::new();
        while self.over_budget(0) {
            let block = match self.buckets[SINK_INDEX].pop() {
                Some(block) => block,
                None => match self.buckets[self.max_index_used].pop() {
                    Some(block) => {
                        if self.buckets[self.max_index_used].is_empty() {
                            self.recompute_max_index();
                        }
                        block
                    }
                    None => break,
                },
            };
            self.current_free -= block.size();
            evicted.push(block);
        }
        evicted
    }
}

/// Shared backing store of raw blocks beneath one or more pools.
pub struct Allocator {
    config: AllocatorConfig,
    free: Mutex<FreeLists>,
    stats: AtomicAllocatorStats,
}

impl Allocator {
    /// Create an allocator with the given configuration.
    pub fn new(config: AllocatorConfig) -> Result<Self, AllocError> {
        let config = config.normalize();
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: AllocatorConfig) -> Self {
        let buckets = (0..=config.max_index).map(|_| Vec::new()).collect();
        Self {
            free: Mutex::new(FreeLists {
                buckets,
                max_index_used: 0,
                current_free: 0,
                max_free: config.max_free_bytes,
            }),
            config,
            stats: AtomicAllocatorStats::new(),
        }
    }

    /// Configuration this allocator was built with.
    #[must_use]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Bucket index and rounded block size for a request of `size` bytes.
    ///
    /// Returns `None` if the rounded size does not fit `usize`.
    #[must_use]
    pub fn size_class(&self, size: usize) -> Option<(usize, usize)> {
        let boundary = self.config.boundary();
        let pages = size.div_ceil(boundary).max(crate::config::MIN_BLOCK_PAGES);
        match pages.checked_next_power_of_two() {
            Some(rounded) => {
                let index = rounded.trailing_zeros() as usize;
                if index <= self.config.max_index {
                    return Some((index, boundary << index));
                }
                Some((SINK_INDEX, pages.checked_mul(boundary)?))
            }
            None => Some((SINK_INDEX, pages.checked_mul(boundary)?)),
        }
    }

    /// Obtain a block of at least `size` bytes.
    ///
    /// Serves the matching-or-next-larger cached bucket first and maps a
    /// fresh block otherwise.
    pub fn alloc(&self, size: usize) -> Result<Block, AllocError> {
        let (index, block_size) = self
            .size_class(size)
            .ok_or(AllocError::OutOfMemory { size })?;

        let cached = {
            let mut free = self.free.lock();
            if index == SINK_INDEX {
                free.take_sink(block_size)
            } else {
                free.take_sized(index)
            }
        };
        if let Some(mut block) = cached {
            block.renew();
            self.stats.record_hit(block.size());
            return Ok(block);
        }

        match Block::map(block_size, index) {
            Ok(block) => {
                debug!(size = block_size, index, "mapped block");
                self.stats.record_miss(block_size);
                Ok(block)
            }
            Err(err) => {
                error!(size = block_size, "block allocation failed");
                Err(err)
            }
        }
    }

    /// Return a block, caching it unless the free budget would be exceeded.
    pub fn free(&self, block: Block) {
        self.free_many(std::iter::once(block));
    }

    /// Return a chain of blocks under one lock acquisition.
    pub fn free_many<I>(&self, blocks: I)
    where
        I: IntoIterator<Item = Block>,
    {
        let mut unmapped = Vec::new();
        {
            let mut free = self.free.lock();
            for block in blocks {
                self.stats.record_return(block.size());
                if free.over_budget(block.size()) {
                    unmapped.push(block);
                } else {
                    free.push(block);
                }
            }
        }
        for block in unmapped {
            debug!(size = block.size(), "unmapped block over free budget");
            self.stats.record_eviction();
        }
    }

    /// Change the free-byte budget, trimming the cache if it is now over.
    pub fn set_max_free(&self, max_free: usize) {
        let evicted = {
            let mut free = self.free.lock();
            free.max_free = max_free;
            free.trim()
        };
        for _ in &evicted {
            self.stats.record_eviction();
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), max_free, "trimmed allocator cache");
        }
    }

    /// Current free-byte budget (0 = unlimited).
    #[must_use]
    pub fn max_free(&self) -> usize {
        self.free.lock().max_free
    }

    /// Bytes currently cached in free lists.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.free.lock().current_free
    }

    /// Number of cached blocks across all buckets.
    #[must_use]
    pub fn cached_blocks(&self) -> usize {
        self.free.lock().buckets.iter().map(Vec::len).sum()
    }

    /// Bytes currently handed out to pools.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.stats.allocated_bytes()
    }

    /// Get a snapshot of allocator statistics.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let cached = self.cached_bytes();
        self.stats.snapshot(cached)
    }

    /// Reset allocator event counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Drop every cached block.
    pub fn purge(&self) {
        let drained: Vec<Block> = {
            let mut free = self.free.lock();
            free.current_free = 0;
            free.max_index_used = 0;
            free.buckets.iter_mut().flat_map(std::mem::take).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "purged allocator cache");
        }
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::build(AllocatorConfig::default())
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
