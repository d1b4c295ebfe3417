//! # poolkit-shim
//!
//! Pool and allocator handles that route each call either to the native
//! `poolkit_core` implementation or to a foreign pool library resolved by
//! symbol name at startup.
//!
//! When any required symbol is missing the foreign interface stays inert:
//! native handles keep working and every foreign call fails with
//! [`ShimError::BackendUnavailable`]. [`reverse`] exposes native pools under
//! the foreign signatures, so the same table can be filled from Rust.

pub mod dispatch;
pub mod error;
pub mod handle;
pub mod loader;
pub mod reverse;
pub mod symbols;

pub use dispatch::{AllocatorHandle, ForeignAllocator, ForeignPool, Memory, PoolHandle};
pub use error::ShimError;
pub use handle::{PoolKind, RawHandle};
pub use loader::{init, init_from, interface, terminate, ForeignInterface};
pub use reverse::{export_pool, exported_pools, lookup_pool, native_exports, publish_native};
pub use symbols::{names, ExportRegistry, ForeignTable, Symbol, SymbolSource, SYMBOL_NAMES};
