//! Constants for pool sizing, alignment, large-object handling and exit codes.

/// Default alignment for `palloc` (enough for any primitive type).
pub const DEFAULT_ALIGN: usize = 16;

/// Size requested for a pool's self block.
pub const INITIAL_BLOCK_SIZE: usize = 8 * 1024;

/// Upper bound for the doubling growth of chained blocks.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Requests at or above this size bypass the block chain.
pub const LARGE_THRESHOLD: usize = 64 * 1024;

/// A cached large block is reused only if it served a request no more
/// than this many times larger than the new one.
pub const LARGE_REUSE_FACTOR: usize = 2;

/// Byte cap of the per-pool large-block reuse list.
pub const LARGE_CACHE_MAX_BYTES: usize = 16 * 1024 * 1024;

/// Process exit codes used by the `poolkit` binary.
pub mod exit_codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Generic error.
    pub const ERROR_GENERIC: i32 = 1;
    /// The system allocator refused a block.
    pub const ERROR_OUT_OF_MEMORY: i32 = 2;
    /// Retains were still outstanding at runtime termination.
    pub const ERROR_LEAK: i32 = 3;
    /// Invalid configuration.
    pub const ERROR_CONFIG: i32 = 4;
}
