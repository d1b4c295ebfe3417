//! Error types for pools and the runtime lifecycle.

use poolkit_alloc::AllocError;

/// Errors raised by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The backing allocator could not provide memory. Unrecoverable.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
    },

    /// The pool handle refers to a pool that was destroyed.
    #[error("pool handle refers to a destroyed pool")]
    StalePool,

    /// The allocation belongs to storage that was cleared or freed.
    #[error("allocation refers to cleared or freed storage")]
    StaleAllocation,

    /// The typed value was dropped by a clear of its pool.
    #[error("pool value was dropped by a clear")]
    StaleValue,

    /// A byte view returned by `bytes`/`bytes_mut` is still alive.
    #[error("pool tree is borrowed by an outstanding byte view")]
    Busy,

    /// Alignment is zero or not a power of two.
    #[error("invalid alignment {0}")]
    InvalidAlignment(usize),

    /// An access range falls outside its allocation.
    #[error("range {offset}..{offset}+{len} outside allocation of {size} bytes")]
    OutOfBounds {
        /// Start of the access.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Size of the allocation.
        size: usize,
    },

    /// Pool bytes were not valid UTF-8.
    #[error("invalid UTF-8 in pool string: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Allocator configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<AllocError> for PoolError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory { size } => Self::OutOfMemory { size },
            AllocError::InvalidConfig(msg) => Self::Config(msg),
        }
    }
}

/// Errors raised by the process-wide runtime lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// `init` was called while the runtime was already running.
    #[error("runtime already initialized")]
    AlreadyInitialized,

    /// `terminate` was called before `init`.
    #[error("runtime not initialized")]
    NotInitialized,
}
