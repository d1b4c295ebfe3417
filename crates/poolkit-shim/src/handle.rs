//! Handle kinds and raw handle values.

use std::fmt;
use std::num::NonZeroU64;

/// Which implementation produced a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// This crate's pools.
    Native,
    /// A pool implementation reached through the foreign function table.
    Foreign,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Foreign => f.write_str("foreign"),
        }
    }
}

/// Opaque non-null handle passed across the foreign boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(NonZeroU64);

impl RawHandle {
    /// Wrap a raw value; `None` for zero.
    #[must_use]
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    /// Raw value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Opaque word stored as native userdata on behalf of foreign callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawData(pub(crate) usize);
