//! Intrusive reference counting.
//!
//! Objects embed a [`RefCount`] and implement [`Ref`]. [`Rc`] is the owning
//! handle: cloning retains, dropping releases, and the object's
//! [`Ref::on_last_release`] hook runs exactly once when the count reaches
//! zero. Each handle carries a [`RetainId`] so a [`RetainTracker`] can pair
//! every release with the retain it undoes.

mod rc;
mod shared;
mod tracker;

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub use rc::{Rc, Weak};
pub use shared::{SharedHandle, SharedMode};
pub use tracker::RetainTracker;

use crate::runtime;

/// Flag bit marking objects whose memory belongs to a pool.
pub const POOL_OWNED: u32 = 1 << 31;

const COUNT_MASK: u32 = !POOL_OWNED;

static NEXT_RETAIN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one retain, used to pair it with its release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RetainId(u64);

impl RetainId {
    /// Sentinel asking `retain` to allocate a fresh id.
    pub const NEW: Self = Self(0);

    /// Allocate a fresh id.
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_RETAIN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether this is the [`RetainId::NEW`] sentinel.
    #[must_use]
    pub fn is_new(self) -> bool {
        self.0 == 0
    }

    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Atomic reference count with a pool-ownership flag in the top bit.
#[derive(Debug)]
pub struct RefCount(AtomicU32);

impl RefCount {
    /// Count of one, owned by the heap.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Count of one, memory owned by a pool.
    #[must_use]
    pub const fn pool_owned() -> Self {
        Self(AtomicU32::new(1 | POOL_OWNED))
    }

    /// Current count.
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire) & COUNT_MASK
    }

    /// Whether the pool-ownership flag is set.
    pub fn is_pool_owned(&self) -> bool {
        self.0.load(Ordering::Relaxed) & POOL_OWNED != 0
    }

    pub(crate) fn set_pool_owned(&self) {
        self.0.fetch_or(POOL_OWNED, Ordering::Relaxed);
    }

    /// Add one reference; returns the new count.
    pub fn increment(&self) -> u32 {
        let prev = self.0.fetch_add(1, Ordering::Relaxed) & COUNT_MASK;
        debug_assert!(prev != 0, "retain of an object already released");
        debug_assert!(prev < COUNT_MASK - 1, "reference count overflow");
        prev + 1
    }

    /// Add one reference unless the count already reached zero.
    pub fn try_increment(&self) -> Option<u32> {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current & COUNT_MASK == 0 {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return Some((prev & COUNT_MASK) + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one reference; returns the new count.
    pub fn decrement(&self) -> u32 {
        let prev = self.0.fetch_sub(1, Ordering::Release) & COUNT_MASK;
        debug_assert!(prev != 0, "release of an object already released");
        if prev == 1 {
            fence(Ordering::Acquire);
        }
        prev.wrapping_sub(1)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

/// Address used to key an object in the tracker.
pub(crate) fn object_key<T: ?Sized>(object: &T) -> usize {
    std::ptr::from_ref(object).cast::<()>() as usize
}

/// An object with an embedded [`RefCount`].
pub trait Ref {
    /// The embedded count.
    fn ref_count(&self) -> &RefCount;

    /// Hook run once, when the last reference is released.
    fn on_last_release(&self) {}

    /// Tracker recording this object's retains. Defaults to the runtime's.
    fn tracker(&self) -> Option<Arc<RetainTracker>> {
        runtime::tracker()
    }

    /// Add a reference. Pass [`RetainId::NEW`] to get a fresh id back.
    fn retain(&self, id: RetainId) -> RetainId {
        let count = self.ref_count().increment();
        match self.tracker() {
            Some(tracker) => tracker.record(object_key(self), id, count),
            None => id,
        }
    }

    /// Drop the reference `id`. Returns whether it was the last one.
    fn release(&self, id: RetainId) -> bool {
        if let Some(tracker) = self.tracker() {
            tracker.forget(object_key(self), id);
        }
        if self.ref_count().decrement() == 0 {
            self.on_last_release();
            true
        } else {
            false
        }
    }
}
