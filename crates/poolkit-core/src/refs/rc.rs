//! Owning handle over an intrusively counted object.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{object_key, Ref, RetainId};
use crate::error::PoolError;
use crate::pool::{Pool, ReleaseQueue};

/// Pool slot holding a pool-owned object.
struct PoolSlot<T> {
    cell: Arc<Mutex<Option<Arc<T>>>>,
    epoch: u64,
    slot: usize,
    released: ReleaseQueue,
}

impl<T> PoolSlot<T> {
    /// Drop the pool's reference and hand the slot back.
    fn vacate(&self) {
        let stored = self.cell.lock().take();
        drop(stored);
        self.released.lock().push((self.epoch, self.slot));
    }
}

/// Owning reference to a [`Ref`] object.
///
/// Every handle holds exactly one retain on the object. Cloning retains
/// under a fresh id; dropping releases the id the handle was created with.
pub struct Rc<T: Ref> {
    inner: Arc<T>,
    id: RetainId,
    slot: Option<Arc<PoolSlot<T>>>,
}

impl<T: Ref> Rc<T> {
    /// Place `value` on the heap. Its count must start at one.
    pub fn create(value: T) -> Self {
        let inner = Arc::new(value);
        let id = Self::initial_id(&inner);
        Self {
            inner,
            id,
            slot: None,
        }
    }

    /// Place `value` in a slot of `pool`.
    ///
    /// The object is flagged pool-owned. When its count reaches zero it is
    /// torn down and the slot goes back to the pool for reuse; otherwise the
    /// pool lets go of it when cleared.
    pub fn alloc(pool: &Pool, value: T) -> Result<Self, PoolError>
    where
        T: 'static,
    {
        value.ref_count().set_pool_owned();
        let inner = Arc::new(value);
        let cell = Arc::new(Mutex::new(Some(Arc::clone(&inner))));
        let (epoch, slot, released) = pool.adopt_releasable(Box::new(Arc::clone(&cell)))?;
        let id = Self::initial_id(&inner);
        Ok(Self {
            inner,
            id,
            slot: Some(Arc::new(PoolSlot {
                cell,
                epoch,
                slot,
                released,
            })),
        })
    }

    fn initial_id(inner: &Arc<T>) -> RetainId {
        debug_assert_eq!(inner.ref_count().count(), 1, "new objects start with one reference");
        match inner.tracker() {
            Some(tracker) => tracker.record(object_key(&**inner), RetainId::NEW, 1),
            None => RetainId::NEW,
        }
    }

    /// Id of the retain this handle holds.
    pub fn retain_id(this: &Self) -> RetainId {
        this.id
    }

    /// Current reference count of the object.
    pub fn count(this: &Self) -> u32 {
        this.inner.ref_count().count()
    }

    /// Non-owning reference that does not hold a retain.
    pub fn downgrade(this: &Self) -> Weak<T> {
        Weak {
            inner: Arc::downgrade(&this.inner),
            slot: this.slot.clone(),
        }
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }
}

impl<T: Ref> Clone for Rc<T> {
    fn clone(&self) -> Self {
        let id = self.inner.retain(RetainId::NEW);
        Self {
            inner: Arc::clone(&self.inner),
            id,
            slot: self.slot.clone(),
        }
    }
}

impl<T: Ref> Drop for Rc<T> {
    fn drop(&mut self) {
        if self.inner.release(self.id) {
            if let Some(slot) = &self.slot {
                slot.vacate();
            }
        }
    }
}

impl<T: Ref> Deref for Rc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

/// Non-owning reference to a [`Ref`] object, from [`Rc::downgrade`].
pub struct Weak<T: Ref> {
    inner: std::sync::Weak<T>,
    slot: Option<Arc<PoolSlot<T>>>,
}

impl<T: Ref> Weak<T> {
    /// Retain the object, unless its count already reached zero.
    pub fn upgrade(&self) -> Option<Rc<T>> {
        let inner = self.inner.upgrade()?;
        let count = inner.ref_count().try_increment()?;
        let id = match inner.tracker() {
            Some(tracker) => tracker.record(object_key(&*inner), RetainId::NEW, count),
            None => RetainId::NEW,
        };
        Some(Rc {
            inner,
            id,
            slot: self.slot.clone(),
        })
    }
}

impl<T: Ref> Clone for Weak<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<T: Ref> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Weak")
            .field("pool_owned", &self.slot.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Ref + fmt::Debug> fmt::Debug for Rc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rc")
            .field("count", &Self::count(self))
            .field("value", &*self.inner)
            .finish()
    }
}
