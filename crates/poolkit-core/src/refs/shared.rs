//! Reference-counted handle owning a dedicated pool.
//!
//! A [`SharedHandle`] creates its own pool (optionally with its own
//! allocator), places itself in that pool, then builds its payload there.
//! The payload's constructor gets the pool and a [`Weak`] back-reference to
//! the handle. The pool is destroyed when the last reference goes away.
//! Given a parent, the dedicated pool is a child of it and a parent
//! pre-cleanup invalidates the handle if the parent is torn down first.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc as LocalRc;
use std::sync::Arc;

use poolkit_alloc::Allocator;
use tracing::{debug, warn};

use super::{Rc, Ref, RefCount, Weak};
use crate::error::PoolError;
use crate::pool::{CleanupId, Pool, PoolValue};
use crate::runtime;

/// What a [`SharedHandle`] creates for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedMode {
    /// A dedicated pool on the parent's (or a fresh) allocator.
    Pool,
    /// A dedicated pool on a dedicated allocator.
    PoolWithAllocator,
}

struct HandleState<T> {
    pool: Option<Pool>,
    allocator: Option<Arc<Allocator>>,
    payload: Option<PoolValue<T>>,
}

impl<T> HandleState<T> {
    fn invalidate(&mut self) -> Option<Pool> {
        self.payload = None;
        self.allocator = None;
        self.pool.take()
    }
}

/// Counted owner of a dedicated pool and the payload built inside it.
pub struct SharedHandle<T: 'static> {
    refs: RefCount,
    mode: SharedMode,
    parent: Option<Pool>,
    guard: Cell<Option<CleanupId>>,
    state: LocalRc<RefCell<HandleState<T>>>,
}

impl<T: 'static> SharedHandle<T> {
    /// Create a handle with a standalone pool. `ctor` builds the payload;
    /// it may allocate from the pool and keep the back-reference.
    pub fn create<F>(mode: SharedMode, ctor: F) -> Result<Rc<Self>, PoolError>
    where
        F: FnOnce(&Pool, &Weak<Self>) -> Result<T, PoolError>,
    {
        Self::build(None, mode, ctor)
    }

    /// Create a handle whose pool is a child of `parent`.
    pub fn create_in<F>(parent: &Pool, mode: SharedMode, ctor: F) -> Result<Rc<Self>, PoolError>
    where
        F: FnOnce(&Pool, &Weak<Self>) -> Result<T, PoolError>,
    {
        Self::build(Some(parent), mode, ctor)
    }

    fn build<F>(parent: Option<&Pool>, mode: SharedMode, ctor: F) -> Result<Rc<Self>, PoolError>
    where
        F: FnOnce(&Pool, &Weak<Self>) -> Result<T, PoolError>,
    {
        let allocator = match mode {
            SharedMode::PoolWithAllocator => Some(Arc::new(Allocator::default())),
            SharedMode::Pool => None,
        };
        let pool = match (parent, &allocator) {
            (Some(parent), Some(allocator)) => {
                parent.create_child_with_allocator(Arc::clone(allocator))?
            }
            (Some(parent), None) => parent.create_child()?,
            (None, Some(allocator)) => Pool::with_allocator(Arc::clone(allocator))?,
            (None, None) => Pool::new()?,
        };

        let shell = Self {
            refs: RefCount::new(),
            mode,
            parent: parent.cloned(),
            guard: Cell::new(None),
            state: LocalRc::new(RefCell::new(HandleState {
                pool: Some(pool.clone()),
                allocator,
                payload: None,
            })),
        };
        let handle = match Rc::alloc(&pool, shell) {
            Ok(handle) => handle,
            Err(err) => {
                let _ = pool.destroy();
                return Err(err);
            }
        };
        runtime::record_shared_created();

        // From here on, dropping `handle` tears everything down.
        let owner = Rc::downgrade(&handle);
        let payload = ctor(&pool, &owner).and_then(|value| pool.emplace(value))?;
        handle.state.borrow_mut().payload = Some(payload);

        if let Some(parent) = parent {
            let weak = LocalRc::downgrade(&handle.state);
            let id = parent.pre_cleanup_register(move || {
                if let Some(state) = weak.upgrade() {
                    let detached = state.borrow_mut().invalidate();
                    drop(detached);
                    debug!("shared handle invalidated by parent teardown");
                }
            })?;
            handle.guard.set(Some(id));
        }
        Ok(handle)
    }

    /// The payload, unless the pool has been torn down.
    pub fn get(&self) -> Option<LocalRc<T>> {
        let state = self.state.borrow();
        let pool = state.pool.as_ref()?;
        pool.value(state.payload.as_ref()?).ok()
    }

    /// The dedicated pool, unless torn down.
    pub fn pool(&self) -> Option<Pool> {
        self.state.borrow().pool.clone()
    }

    /// The dedicated allocator, in [`SharedMode::PoolWithAllocator`].
    pub fn allocator(&self) -> Option<Arc<Allocator>> {
        self.state.borrow().allocator.clone()
    }

    /// Parent the dedicated pool hangs off, if any.
    pub fn parent(&self) -> Option<&Pool> {
        self.parent.as_ref()
    }

    /// Creation mode.
    pub fn mode(&self) -> SharedMode {
        self.mode
    }

    /// Whether the pool and payload are still there.
    pub fn is_valid(&self) -> bool {
        self.get().is_some()
    }
}

impl<T: 'static> Ref for SharedHandle<T> {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }

    fn on_last_release(&self) {
        let pool = self.state.borrow_mut().invalidate();
        if let (Some(parent), Some(id)) = (&self.parent, self.guard.take()) {
            match parent.cleanup_kill(id) {
                Ok(_) | Err(PoolError::StalePool) => {}
                Err(err) => warn!(%err, "could not unregister shared handle guard"),
            }
        }
        if let Some(pool) = pool {
            if let Err(err) = pool.destroy() {
                warn!(%err, "shared handle pool teardown failed");
            }
        }
        runtime::record_shared_released();
    }
}

impl<T: 'static> Rc<SharedHandle<T>> {
    /// The payload. Asserts in debug builds that it is still there.
    pub fn payload(&self) -> Option<LocalRc<T>> {
        let payload = self.get();
        debug_assert!(payload.is_some(), "payload accessed after its pool was torn down");
        payload
    }
}

impl<T: 'static> fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("mode", &self.mode)
            .field("refs", &self.refs.count())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_lives_in_dedicated_pool() {
        let handle = SharedHandle::create(SharedMode::Pool, |pool, _| {
            let name = pool.strdup("payload")?;
            Ok((name, 5_u32))
        })
        .unwrap();
        let payload = handle.payload().unwrap();
        let pool = handle.pool().unwrap();
        assert_eq!(pool.read_str(&payload.0).unwrap(), "payload");
        assert_eq!(payload.1, 5);
        assert!(handle.allocator().is_none());
    }

    #[test]
    fn last_release_destroys_pool() {
        let handle = SharedHandle::create(SharedMode::PoolWithAllocator, |_, _| Ok(1_u8)).unwrap();
        let pool = handle.pool().unwrap();
        let allocator = handle.allocator().unwrap();
        let second = handle.clone();
        drop(handle);
        assert!(pool.is_alive());
        drop(second);
        assert!(!pool.is_alive());
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn parent_teardown_invalidates() {
        let parent = Pool::new().unwrap();
        let handle = SharedHandle::create_in(&parent, SharedMode::Pool, |_, _| Ok(String::from("x")))
            .unwrap();
        let pool = handle.pool().unwrap();
        assert_eq!(pool.parent().unwrap(), Some(parent.clone()));
        parent.clear().unwrap();
        assert!(!handle.is_valid());
        assert!(handle.get().is_none());
        assert!(!pool.is_alive());
        drop(handle);
        assert_eq!(parent.stats().unwrap().pre_cleanups, 0);
    }

    #[test]
    fn release_before_parent_unregisters_guard() {
        let parent = Pool::new().unwrap();
        let handle =
            SharedHandle::create_in(&parent, SharedMode::PoolWithAllocator, |_, _| Ok(3_i64)).unwrap();
        assert_eq!(parent.stats().unwrap().pre_cleanups, 1);
        assert_eq!(parent.children().unwrap().len(), 1);
        drop(handle);
        assert_eq!(parent.stats().unwrap().pre_cleanups, 0);
        assert!(parent.children().unwrap().is_empty());
    }

    /// Payload that reaches its owner through the back-reference.
    struct Session {
        owner: Weak<SharedHandle<Session>>,
    }

    impl Session {
        fn note(&self, text: &str) -> Option<String> {
            let owner = self.owner.upgrade()?;
            let pool = owner.pool()?;
            let stored = pool.strdup(text).ok()?;
            pool.read_str(&stored).ok()
        }
    }

    #[test]
    fn payload_keeps_back_reference() {
        let handle = SharedHandle::create(SharedMode::Pool, |pool, owner| {
            assert!(owner.upgrade().is_some());
            assert_eq!(pool.stats()?.values, 1);
            Ok(Session {
                owner: owner.clone(),
            })
        })
        .unwrap();
        assert!(handle.ref_count().is_pool_owned());
        let session = handle.payload().unwrap();
        assert_eq!(session.note("hello").as_deref(), Some("hello"));
        assert_eq!(Rc::count(&handle), 1);

        let pool = handle.pool().unwrap();
        drop(handle);
        assert!(!pool.is_alive());
        assert!(session.owner.upgrade().is_none());
        assert!(session.note("late").is_none());
    }

    #[test]
    fn clearing_dedicated_pool_invalidates() {
        let handle = SharedHandle::create(SharedMode::Pool, |_, _| Ok(9_u16)).unwrap();
        assert!(handle.is_valid());
        handle.pool().unwrap().clear().unwrap();
        assert!(handle.get().is_none());
        assert!(!handle.is_valid());
    }

    #[test]
    fn failed_ctor_leaves_nothing_behind() {
        let parent = Pool::new().unwrap();
        let result = SharedHandle::<u8>::create_in(&parent, SharedMode::Pool, |_, _| {
            Err(PoolError::InvalidAlignment(3))
        });
        assert!(result.is_err());
        assert!(parent.children().unwrap().is_empty());
        assert_eq!(parent.stats().unwrap().pre_cleanups, 0);
    }
}
