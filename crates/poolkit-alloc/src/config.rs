//! Allocator configuration and size-class constants.

use serde::{Deserialize, Serialize};

use crate::error::AllocError;

/// Default log2 of the block boundary (4 KiB).
pub const BOUNDARY_INDEX: u32 = 12;

/// Default number of size-class buckets above the sink bucket.
///
/// Bucket `i` (for `1 <= i <= MAX_INDEX`) caches blocks of exactly
/// `boundary << i` bytes; bucket 0 is the sink for larger blocks.
pub const MAX_INDEX: usize = 20;

/// Smallest block the allocator hands out, in boundary units.
pub const MIN_BLOCK_PAGES: usize = 2;

/// Sentinel for an unlimited free-byte budget.
pub const UNLIMITED_FREE: usize = 0;

/// Configuration for an [`Allocator`](crate::Allocator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Log2 of the block boundary; every block size is a multiple of it.
    pub boundary_index: u32,
    /// Highest bucket index; blocks above `boundary << max_index` go to the sink.
    pub max_index: usize,
    /// Largest number of free bytes kept cached (0 = unlimited).
    pub max_free_bytes: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            boundary_index: BOUNDARY_INDEX,
            max_index: MAX_INDEX,
            max_free_bytes: UNLIMITED_FREE,
        }
    }
}

impl AllocatorConfig {
    /// Normalize the configuration, applying defaults where values are zero.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.boundary_index == 0 {
            self.boundary_index = BOUNDARY_INDEX;
        }
        if self.max_index == 0 {
            self.max_index = MAX_INDEX;
        }
        self
    }

    /// Check that the bucket range fits the address space.
    pub fn validate(&self) -> Result<(), AllocError> {
        if !(6..=24).contains(&self.boundary_index) {
            return Err(AllocError::InvalidConfig(format!(
                "boundary_index {} outside 6..=24",
                self.boundary_index
            )));
        }
        let top = self.boundary_index as usize + self.max_index;
        if self.max_index == 0 || top >= usize::BITS as usize {
            return Err(AllocError::InvalidConfig(format!(
                "max_index {} overflows the block size range",
                self.max_index
            )));
        }
        Ok(())
    }

    /// Block boundary in bytes.
    #[must_use]
    pub fn boundary(&self) -> usize {
        1usize << self.boundary_index
    }

    /// Smallest block size handed out.
    #[must_use]
    pub fn min_block_size(&self) -> usize {
        self.boundary() * MIN_BLOCK_PAGES
    }

    /// Largest block size that still has its own bucket.
    #[must_use]
    pub fn max_bucket_size(&self) -> usize {
        self.boundary() << self.max_index
    }
}
