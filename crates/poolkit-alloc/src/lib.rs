//! # poolkit-alloc
//!
//! Backing store for `poolkit` pools.
//!
//! Provides raw [`Block`]s with a bump cursor, the shared [`Allocator`] that
//! hands them out from size-bucketed free lists, allocator configuration and
//! lock-free usage statistics. The allocator is the only `poolkit` component
//! built for concurrent use: many pools, on many threads, may share one.
#![warn(missing_docs)]

pub mod allocator;
pub mod block;
pub mod config;
pub mod error;
pub mod stats;

pub use allocator::Allocator;
pub use block::{Block, BlockId};
pub use config::AllocatorConfig;
pub use error::AllocError;
pub use stats::AllocatorStats;
