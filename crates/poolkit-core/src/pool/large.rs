//! Per-pool cache for large allocations.
//!
//! Large requests get a dedicated block each. Freed blocks go to a list
//! sorted by capacity and are handed back out when a later request is close
//! enough in size. Everything returns to the allocator on clear.

use poolkit_alloc::{AllocError, Allocator, Block, BlockId};
use serde::Serialize;
use tracing::trace;

use crate::constants::LARGE_REUSE_FACTOR;

struct LargeEntry {
    block: Block,
    requested: usize,
}

/// Counters for one pool's large-block cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LargeStats {
    /// Requests served from the reuse list.
    pub hits: u64,
    /// Requests that needed a fresh block.
    pub misses: u64,
    /// Bytes in blocks currently handed out.
    pub in_use_bytes: usize,
    /// Bytes in blocks waiting for reuse.
    pub cached_bytes: usize,
}

pub(crate) struct LargeBlockCache {
    in_use: Vec<LargeEntry>,
    free: Vec<LargeEntry>,
    max_cached: usize,
    stats: LargeStats,
}

impl LargeBlockCache {
    pub(crate) fn new(max_cached: usize) -> Self {
        Self {
            in_use: Vec::new(),
            free: Vec::new(),
            max_cached,
            stats: LargeStats::default(),
        }
    }

    /// Serve `size` bytes aligned to `align`. Returns the block id and offset.
    pub(crate) fn alloc(
        &mut self,
        allocator: &Allocator,
        size: usize,
        align: usize,
    ) -> Result<(BlockId, usize), AllocError> {
        if let Some(found) = self.take_reusable(size, align) {
            self.stats.hits += 1;
            return Ok(found);
        }

        let needed = size
            .checked_add(align - 1)
            .ok_or(AllocError::OutOfMemory { size })?;
        let mut block = allocator.alloc(needed)?;
        let offset = block
            .bump(size, align)
            .ok_or(AllocError::OutOfMemory { size })?;
        let id = block.id();
        self.stats.misses += 1;
        self.stats.in_use_bytes += block.size();
        self.in_use.push(LargeEntry {
            block,
            requested: size,
        });
        Ok((id, offset))
    }

    fn take_reusable(&mut self, size: usize, align: usize) -> Option<(BlockId, usize)> {
        let limit = size.saturating_mul(LARGE_REUSE_FACTOR);
        let start = self.free.partition_point(|e| e.block.size() < size);
        for pos in start..self.free.len() {
            let entry = &mut self.free[pos];
            if entry.requested > limit {
                continue;
            }
            entry.block.renew();
            let Some(offset) = entry.block.bump(size, align) else {
                continue;
            };
            let mut entry = self.free.remove(pos);
            entry.requested = size;
            let id = entry.block.id();
            let bytes = entry.block.size();
            self.stats.cached_bytes -= bytes;
            self.stats.in_use_bytes += bytes;
            trace!(size, block = bytes, "large block reused");
            self.in_use.push(entry);
            return Some((id, offset));
        }
        None
    }

    /// Move a block from in-use to the reuse list, evicting the largest
    /// cached blocks to the allocator while over the byte cap.
    pub(crate) fn release(&mut self, allocator: &Allocator, id: BlockId) -> bool {
        let Some(pos) = self.in_use.iter().position(|e| e.block.id() == id) else {
            return false;
        };
        let mut entry = self.in_use.swap_remove(pos);
        entry.block.renew();
        let bytes = entry.block.size();
        self.stats.in_use_bytes -= bytes;
        self.stats.cached_bytes += bytes;
        let at = self.free.partition_point(|e| e.block.size() <= bytes);
        self.free.insert(at, entry);

        let mut evicted = Vec::new();
        while self.stats.cached_bytes > self.max_cached {
            let Some(entry) = self.free.pop() else { break };
            self.stats.cached_bytes -= entry.block.size();
            evicted.push(entry.block);
        }
        if !evicted.is_empty() {
            allocator.free_many(evicted);
        }
        true
    }

    pub(crate) fn find(&self, id: BlockId) -> Option<&Block> {
        self.in_use
            .iter()
            .map(|e| &e.block)
            .find(|b| b.id() == id)
    }

    pub(crate) fn find_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.in_use
            .iter_mut()
            .map(|e| &mut e.block)
            .find(|b| b.id() == id)
    }

    /// Drop every block, in use or cached, and zero the byte counters.
    pub(crate) fn reset(&mut self) -> Vec<Block> {
        self.stats.in_use_bytes = 0;
        self.stats.cached_bytes = 0;
        self.in_use
            .drain(..)
            .chain(self.free.drain(..))
            .map(|e| e.block)
            .collect()
    }

    pub(crate) fn stats(&self) -> LargeStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALIGN: usize = 16;

    #[test]
    fn fresh_then_reused() {
        let allocator = Allocator::default();
        let mut cache = LargeBlockCache::new(1 << 24);
        let (first, _) = cache.alloc(&allocator, 100_000, ALIGN).unwrap();
        assert!(cache.release(&allocator, first));
        let (second, _) = cache.alloc(&allocator, 90_000, ALIGN).unwrap();
        assert_ne!(first, second);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(allocator.stats().misses, 1);
    }

    #[test]
    fn much_smaller_request_is_not_reused() {
        let allocator = Allocator::default();
        let mut cache = LargeBlockCache::new(1 << 24);
        let (id, _) = cache.alloc(&allocator, 400_000, ALIGN).unwrap();
        cache.release(&allocator, id);
        cache.alloc(&allocator, 70_000, ALIGN).unwrap();
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn larger_request_is_not_reused() {
        let allocator = Allocator::default();
        let mut cache = LargeBlockCache::new(1 << 24);
        let (id, _) = cache.alloc(&allocator, 70_000, ALIGN).unwrap();
        cache.release(&allocator, id);
        cache.alloc(&allocator, 500_000, ALIGN).unwrap();
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn release_unknown_block() {
        let allocator = Allocator::default();
        let mut cache = LargeBlockCache::new(1 << 24);
        let (id, _) = cache.alloc(&allocator, 70_000, ALIGN).unwrap();
        assert!(cache.release(&allocator, id));
        assert!(!cache.release(&allocator, id));
    }

    #[test]
    fn cap_evicts_to_allocator() {
        let allocator = Allocator::default();
        let mut cache = LargeBlockCache::new(100_000);
        let (id, _) = cache.alloc(&allocator, 70_000, ALIGN).unwrap();
        cache.release(&allocator, id);
        assert_eq!(cache.stats().cached_bytes, 0);
        assert_eq!(allocator.cached_blocks(), 1);
    }

    #[test]
    fn find_only_sees_in_use() {
        let allocator = Allocator::default();
        let mut cache = LargeBlockCache::new(1 << 24);
        let (id, offset) = cache.alloc(&allocator, 70_000, ALIGN).unwrap();
        assert!(cache.find(id).unwrap().slice(offset, 70_000).is_some());
        cache.find_mut(id).unwrap().slice_mut(offset, 1).unwrap()[0] = 9;
        cache.release(&allocator, id);
        assert!(cache.find(id).is_none());
    }

    #[test]
    fn reset_returns_everything() {
        let allocator = Allocator::default();
        let mut cache = LargeBlockCache::new(1 << 24);
        let (a, _) = cache.alloc(&allocator, 70_000, ALIGN).unwrap();
        cache.alloc(&allocator, 80_000, ALIGN).unwrap();
        cache.release(&allocator, a);
        let blocks = cache.reset();
        assert_eq!(blocks.len(), 2);
        assert!(cache.find(a).is_none());
        assert_eq!(cache.stats().cached_bytes, 0);
        assert_eq!(cache.stats().in_use_bytes, 0);
    }
}
