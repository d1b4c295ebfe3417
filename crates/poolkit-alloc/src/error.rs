//! Allocator error type.

/// Errors raised by the block allocator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The system could not provide a block of the requested size.
    ///
    /// Callers treat this as unrecoverable; there is no retry policy here.
    #[error("out of memory allocating a {size}-byte block")]
    OutOfMemory {
        /// Requested block size in bytes.
        size: usize,
    },

    /// The allocator configuration is unusable.
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),
}
