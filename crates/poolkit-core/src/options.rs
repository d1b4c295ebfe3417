//! Pool options.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ALIGN, INITIAL_BLOCK_SIZE, LARGE_CACHE_MAX_BYTES, LARGE_THRESHOLD, MAX_BLOCK_SIZE,
};

/// Tuning knobs for a pool and the children created from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Size requested for the self block.
    pub initial_block_size: usize,
    /// Cap for doubling growth of chained blocks.
    pub max_block_size: usize,
    /// Requests at or above this size go to the large-block cache.
    pub large_threshold: usize,
    /// Byte cap of the large-block reuse list.
    pub large_cache_max_bytes: usize,
    /// Alignment used by `palloc` when none is given.
    pub default_align: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            initial_block_size: INITIAL_BLOCK_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
            large_threshold: LARGE_THRESHOLD,
            large_cache_max_bytes: LARGE_CACHE_MAX_BYTES,
            default_align: DEFAULT_ALIGN,
        }
    }
}

impl PoolOptions {
    /// Normalize options, applying defaults where values are zero or unusable.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.initial_block_size == 0 {
            self.initial_block_size = INITIAL_BLOCK_SIZE;
        }
        if self.max_block_size == 0 {
            self.max_block_size = MAX_BLOCK_SIZE;
        }
        if self.large_threshold == 0 {
            self.large_threshold = LARGE_THRESHOLD;
        }
        if self.large_cache_max_bytes == 0 {
            self.large_cache_max_bytes = LARGE_CACHE_MAX_BYTES;
        }
        if !self.default_align.is_power_of_two() {
            self.default_align = DEFAULT_ALIGN;
        }
        self.max_block_size = self.max_block_size.max(self.initial_block_size);
        self
    }
}
