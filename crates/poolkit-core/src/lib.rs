//! # poolkit-core
//!
//! Hierarchical memory pools with cleanup chains, plus intrusive reference
//! counting for objects that live in them.
//!
//! A [`Pool`] bump-allocates from blocks supplied by a shared
//! [`Allocator`](poolkit_alloc::Allocator) and releases everything at once
//! on [`Pool::clear`] or [`Pool::destroy`], after running its cleanups and
//! tearing down its children. [`refs::Rc`] and [`refs::SharedHandle`] layer
//! counted ownership on top.
//!
//! # Example
//! ```
//! use poolkit_core::Pool;
//!
//! let pool = Pool::new().unwrap();
//! let greeting = pool.strdup("hello").unwrap();
//! assert_eq!(pool.read_str(&greeting).unwrap(), "hello");
//! pool.destroy().unwrap();
//! ```

pub mod constants;
pub mod error;
pub mod options;
pub mod pool;
pub mod refs;
pub mod runtime;

pub use error::{PoolError, RuntimeError};
pub use options::PoolOptions;
pub use pool::{Allocation, CleanupId, Pool, PoolId, PoolInfo, PoolStats, PoolValue, RawCleanup};
pub use refs::{Rc, Ref, RefCount, RetainId, RetainTracker, SharedHandle, SharedMode, Weak};
pub use runtime::{Diagnostics, RuntimeConfig, TerminationReport};
