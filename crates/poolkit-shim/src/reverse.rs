//! Native pools exported under the foreign function signatures.
//!
//! Foreign code only ever sees [`RawHandle`] values. Each thread keeps its
//! own table from raw handles to native pools and allocators, so a handle
//! is only meaningful on the thread that created it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use poolkit_alloc::Allocator;
use poolkit_core::{Allocation, Pool, PoolInfo, RawCleanup};
use tracing::warn;

use crate::dispatch::raw_userdata_cleanup;
use crate::error::ShimError;
use crate::handle::{RawData, RawHandle};
use crate::symbols::{names, ExportRegistry, Symbol};

#[derive(Default)]
struct HandleTable {
    next: u64,
    pools: HashMap<RawHandle, Pool>,
    allocators: HashMap<RawHandle, Arc<Allocator>>,
    /// Large allocations by address, for `free`.
    large: HashMap<(RawHandle, usize), Allocation>,
}

impl HandleTable {
    fn mint(&mut self) -> Option<RawHandle> {
        self.next += 1;
        RawHandle::new(self.next)
    }

    /// Forget pools destroyed directly or with an ancestor.
    fn prune(&mut self) {
        self.pools.retain(|_, pool| pool.is_alive());
        let pools = &self.pools;
        self.large.retain(|(raw, _), _| pools.contains_key(raw));
    }
}

thread_local! {
    static HANDLES: RefCell<HandleTable> = RefCell::new(HandleTable::default());
}

fn with_pool<R>(raw: RawHandle, f: impl FnOnce(&Pool) -> Option<R>) -> Option<R> {
    let pool = HANDLES.with(|h| h.borrow().pools.get(&raw).cloned());
    match pool {
        Some(pool) => f(&pool),
        None => {
            warn!(%raw, "unknown native pool handle");
            None
        }
    }
}

/// Expose an existing native pool to foreign callers on this thread.
pub fn export_pool(pool: Pool) -> Option<RawHandle> {
    HANDLES.with(|h| {
        let mut table = h.borrow_mut();
        let raw = table.mint()?;
        table.pools.insert(raw, pool);
        Some(raw)
    })
}

/// The native pool behind a raw handle minted on this thread.
pub fn lookup_pool(raw: RawHandle) -> Result<Pool, ShimError> {
    HANDLES
        .with(|h| h.borrow().pools.get(&raw).cloned())
        .ok_or(ShimError::UnknownHandle(raw.get()))
}

/// Number of live pool handles on this thread.
pub fn exported_pools() -> usize {
    HANDLES.with(|h| {
        let mut table = h.borrow_mut();
        table.prune();
        table.pools.len()
    })
}

fn pool_create(parent: Option<RawHandle>, allocator: Option<RawHandle>) -> Option<RawHandle> {
    let allocator = match allocator {
        Some(raw) => Some(HANDLES.with(|h| h.borrow().allocators.get(&raw).cloned())?),
        None => None,
    };
    let pool = match (parent, allocator) {
        (Some(parent), Some(allocator)) => {
            with_pool(parent, |p| p.create_child_with_allocator(allocator).ok())?
        }
        (Some(parent), None) => with_pool(parent, |p| p.create_child().ok())?,
        (None, Some(allocator)) => Pool::with_allocator(allocator).ok()?,
        (None, None) => Pool::new().ok()?,
    };
    export_pool(pool)
}

fn pool_destroy(raw: RawHandle) {
    if let Some(pool) = HANDLES.with(|h| h.borrow_mut().pools.remove(&raw)) {
        if let Err(err) = pool.destroy() {
            warn!(%raw, %err, "native pool destroy failed");
        }
    }
    HANDLES.with(|h| h.borrow_mut().prune());
}

fn pool_clear(raw: RawHandle) {
    with_pool(raw, |p| p.clear().ok());
    HANDLES.with(|h| {
        let mut table = h.borrow_mut();
        table.large.retain(|(owner, _), _| *owner != raw);
        table.prune();
    });
}

/// Remember large allocations so a later `free` can find them.
fn track(raw: RawHandle, pool: &Pool, alloc: Allocation) -> Option<usize> {
    if alloc.len() >= pool.options().ok()?.large_threshold {
        HANDLES.with(|h| h.borrow_mut().large.insert((raw, alloc.addr()), alloc));
    }
    Some(alloc.addr())
}

fn palloc(raw: RawHandle, size: usize, align: usize) -> Option<usize> {
    with_pool(raw, |p| track(raw, p, p.palloc_aligned(size, align).ok()?))
}

fn pcalloc(raw: RawHandle, size: usize) -> Option<usize> {
    with_pool(raw, |p| track(raw, p, p.calloc(size).ok()?))
}

fn free(raw: RawHandle, addr: usize, size: usize) {
    let Some(alloc) = HANDLES.with(|h| h.borrow_mut().large.remove(&(raw, addr))) else {
        return;
    };
    with_pool(raw, |p| p.free(&alloc, size).ok());
}

fn cleanup_register(raw: RawHandle, data: usize, cb: RawCleanup) {
    with_pool(raw, |p| p.cleanup_register_raw(data, cb).ok());
}

fn pre_cleanup_register(raw: RawHandle, data: usize, cb: RawCleanup) {
    with_pool(raw, |p| p.pre_cleanup_register_raw(data, cb).ok());
}

fn cleanup_kill(raw: RawHandle, data: usize, cb: RawCleanup) {
    with_pool(raw, |p| p.cleanup_kill_raw(data, cb).ok());
}

fn userdata_set(raw: RawHandle, key: &str, data: usize, cleanup: Option<RawCleanup>) -> bool {
    with_pool(raw, |p| {
        p.userdata_set(key, Rc::new(RawData(data)), raw_userdata_cleanup(cleanup))
            .ok()
    })
    .is_some()
}

fn userdata_setn(
    raw: RawHandle,
    key: &'static str,
    data: usize,
    cleanup: Option<RawCleanup>,
) -> bool {
    with_pool(raw, |p| {
        p.userdata_setn(key, Rc::new(RawData(data)), raw_userdata_cleanup(cleanup))
            .ok()
    })
    .is_some()
}

fn userdata_get(raw: RawHandle, key: &str) -> Option<usize> {
    with_pool(raw, |p| p.userdata_get_as::<RawData>(key).ok().flatten()).map(|d| d.0)
}

fn memdup(raw: RawHandle, data: &[u8]) -> Option<usize> {
    with_pool(raw, |p| p.memdup(data).ok()).map(|a| a.addr())
}

fn strdup(raw: RawHandle, s: &str) -> Option<usize> {
    with_pool(raw, |p| p.strdup(s).ok()).map(|a| a.addr())
}

fn tag(raw: RawHandle, tag: &str) {
    with_pool(raw, |p| p.set_tag(tag).ok());
}

fn get_tag(raw: RawHandle) -> Option<String> {
    with_pool(raw, |p| p.tag().ok().flatten())
}

fn set_info(raw: RawHandle, file: &'static str, line: u32) {
    with_pool(raw, |p| p.set_info(PoolInfo { file, line }).ok());
}

fn allocator_create() -> Option<RawHandle> {
    HANDLES.with(|h| {
        let mut table = h.borrow_mut();
        let raw = table.mint()?;
        table
            .allocators
            .insert(raw, Arc::new(Allocator::default()));
        Some(raw)
    })
}

fn allocator_destroy(raw: RawHandle) {
    HANDLES.with(|h| h.borrow_mut().allocators.remove(&raw));
}

fn allocator_max_free_set(raw: RawHandle, bytes: usize) {
    if let Some(allocator) = HANDLES.with(|h| h.borrow().allocators.get(&raw).cloned()) {
        allocator.set_max_free(bytes);
    }
}

/// The native implementation of every required symbol.
pub fn native_exports() -> Vec<(&'static str, Symbol)> {
    vec![
        (names::POOL_CREATE, Symbol::PoolCreate(pool_create)),
        (names::POOL_DESTROY, Symbol::PoolOp(pool_destroy)),
        (names::POOL_CLEAR, Symbol::PoolOp(pool_clear)),
        (names::PALLOC, Symbol::Palloc(palloc)),
        (names::PCALLOC, Symbol::Pcalloc(pcalloc)),
        (names::FREE, Symbol::Free(free)),
        (names::CLEANUP_REGISTER, Symbol::Cleanup(cleanup_register)),
        (names::PRE_CLEANUP_REGISTER, Symbol::Cleanup(pre_cleanup_register)),
        (names::CLEANUP_KILL, Symbol::Cleanup(cleanup_kill)),
        (names::USERDATA_SET, Symbol::UserdataSet(userdata_set)),
        (names::USERDATA_SETN, Symbol::UserdataSetn(userdata_setn)),
        (names::USERDATA_GET, Symbol::UserdataGet(userdata_get)),
        (names::MEMDUP, Symbol::Memdup(memdup)),
        (names::STRDUP, Symbol::Strdup(strdup)),
        (names::TAG, Symbol::Tag(tag)),
        (names::GET_TAG, Symbol::GetTag(get_tag)),
        (names::SET_INFO, Symbol::SetInfo(set_info)),
        (names::ALLOCATOR_CREATE, Symbol::AllocatorCreate(allocator_create)),
        (names::ALLOCATOR_DESTROY, Symbol::AllocatorDestroy(allocator_destroy)),
        (names::ALLOCATOR_MAX_FREE_SET, Symbol::AllocatorMaxFree(allocator_max_free_set)),
    ]
}

/// Publish the native exports into `registry`.
pub fn publish_native(registry: &ExportRegistry) {
    registry.publish_all(native_exports());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{ForeignTable, SYMBOL_NAMES};

    #[test]
    fn exports_cover_every_symbol() {
        let exports = native_exports();
        assert_eq!(exports.len(), SYMBOL_NAMES.len());
        let registry = ExportRegistry::new();
        publish_native(&registry);
        assert!(ForeignTable::resolve(&registry).is_ok());
    }

    #[test]
    fn create_alloc_destroy() {
        let raw = pool_create(None, None).unwrap();
        let addr = strdup(raw, "hi").unwrap();
        assert_ne!(addr, 0);
        let pool = lookup_pool(raw).unwrap();
        assert!(pool.is_alive());
        pool_destroy(raw);
        assert!(!pool.is_alive());
        assert!(matches!(lookup_pool(raw), Err(ShimError::UnknownHandle(_))));
    }

    #[test]
    fn children_disappear_with_parent() {
        let parent = pool_create(None, None).unwrap();
        let child = pool_create(Some(parent), None).unwrap();
        assert!(lookup_pool(child).is_ok());
        pool_destroy(parent);
        assert!(lookup_pool(child).is_err());
    }

    #[test]
    fn large_free_reaches_cache() {
        let raw = pool_create(None, None).unwrap();
        let addr = palloc(raw, 100_000, 16).unwrap();
        free(raw, addr, 100_000);
        palloc(raw, 90_000, 16).unwrap();
        let stats = lookup_pool(raw).unwrap().stats().unwrap();
        assert_eq!(stats.large.hits, 1);
        pool_destroy(raw);
    }

    #[test]
    fn clear_forgets_large_allocations() {
        let raw = pool_create(None, None).unwrap();
        let addr = palloc(raw, 100_000, 16).unwrap();
        assert_eq!(HANDLES.with(|h| h.borrow().large.len()), 1);
        pool_clear(raw);
        assert_eq!(HANDLES.with(|h| h.borrow().large.len()), 0);
        free(raw, addr, 100_000);
        let stats = lookup_pool(raw).unwrap().stats().unwrap();
        assert_eq!(stats.large.cached_bytes, 0);
        pool_destroy(raw);
    }

    #[test]
    fn tag_and_info_round_trip() {
        let raw = pool_create(None, None).unwrap();
        assert_eq!(get_tag(raw), None);
        tag(raw, "exported");
        assert_eq!(get_tag(raw).as_deref(), Some("exported"));
        set_info(raw, "reverse.rs", 7);
        let info = lookup_pool(raw).unwrap().info().unwrap().unwrap();
        assert_eq!((info.file, info.line), ("reverse.rs", 7));
        pool_destroy(raw);
    }

    #[test]
    fn exported_pools_follow_destroy() {
        let before = exported_pools();
        let parent = pool_create(None, None).unwrap();
        pool_create(Some(parent), None).unwrap();
        assert_eq!(exported_pools(), before + 2);
        pool_destroy(parent);
        assert_eq!(exported_pools(), before);
    }

    #[test]
    fn unknown_handle_is_harmless() {
        let bogus = RawHandle::new(u64::MAX).unwrap();
        assert!(palloc(bogus, 8, 8).is_none());
        assert!(!userdata_set(bogus, "k", 1, None));
        pool_destroy(bogus);
    }

    #[test]
    fn allocator_backed_pool() {
        let allocator = allocator_create().unwrap();
        allocator_max_free_set(allocator, 1 << 16);
        let pool = pool_create(None, Some(allocator)).unwrap();
        assert!(palloc(pool, 64, 8).is_some());
        pool_destroy(pool);
        allocator_destroy(allocator);
    }
}
