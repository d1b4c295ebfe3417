//! Native/foreign dispatch through the shim.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use poolkit_core::{Pool, PoolInfo, RawCleanup};
use poolkit_shim::{
    lookup_pool, names, publish_native, AllocatorHandle, ExportRegistry, ForeignInterface,
    ForeignTable, Memory, PoolHandle, PoolKind, RawHandle, ShimError, Symbol, SYMBOL_NAMES,
};

/// In-memory stand-in for a foreign pool library.
mod fake {
    use super::*;

    #[derive(Default)]
    pub struct FakePool {
        pub parent: Option<u64>,
        pub memory: Vec<Box<[u8]>>,
        pub cleanups: Vec<(usize, RawCleanup)>,
        pub userdata: HashMap<String, (usize, Option<RawCleanup>)>,
        pub tag: Option<String>,
        pub info: Option<(&'static str, u32)>,
    }

    pub static CALLS: Mutex<Vec<&'static str>> = parking_lot::const_mutex(Vec::new());
    pub static POOLS: Mutex<Option<HashMap<u64, FakePool>>> = parking_lot::const_mutex(None);
    pub static NEXT: AtomicU64 = AtomicU64::new(1);
    pub static MAX_FREE: AtomicUsize = AtomicUsize::new(0);

    fn log(name: &'static str) {
        CALLS.lock().push(name);
    }

    fn with<R>(raw: RawHandle, f: impl FnOnce(&mut FakePool) -> R) -> Option<R> {
        POOLS.lock().as_mut()?.get_mut(&raw.get()).map(f)
    }

    fn store(raw: RawHandle, bytes: Box<[u8]>) -> Option<usize> {
        with(raw, |p| {
            let addr = bytes.as_ptr() as usize;
            p.memory.push(bytes);
            addr
        })
    }

    pub fn pool_create(parent: Option<RawHandle>, _allocator: Option<RawHandle>) -> Option<RawHandle> {
        log(names::POOL_CREATE);
        let id = NEXT.fetch_add(1, Ordering::Relaxed);
        let pool = FakePool {
            parent: parent.map(RawHandle::get),
            ..FakePool::default()
        };
        POOLS.lock().get_or_insert_with(HashMap::new).insert(id, pool);
        RawHandle::new(id)
    }

    /// Run and drop `id`'s registrations and those of its descendants.
    fn teardown(id: u64, remove: bool) {
        let children: Vec<u64> = POOLS
            .lock()
            .as_ref()
            .map(|pools| {
                pools
                    .iter()
                    .filter(|(_, p)| p.parent == Some(id))
                    .map(|(child, _)| *child)
                    .collect()
            })
            .unwrap_or_default();
        let (cleanups, userdata) = {
            let mut guard = POOLS.lock();
            let Some(pool) = guard.as_mut().and_then(|pools| pools.get_mut(&id)) else {
                return;
            };
            (
                std::mem::take(&mut pool.cleanups),
                std::mem::take(&mut pool.userdata),
            )
        };
        for (data, cb) in cleanups.into_iter().rev() {
            cb(data);
        }
        for (data, cb) in userdata.into_values() {
            if let Some(cb) = cb {
                cb(data);
            }
        }
        for child in children {
            teardown(child, true);
        }
        let mut guard = POOLS.lock();
        if let Some(pools) = guard.as_mut() {
            if remove {
                pools.remove(&id);
            } else if let Some(pool) = pools.get_mut(&id) {
                pool.memory.clear();
            }
        }
    }

    pub fn pool_destroy(raw: RawHandle) {
        log(names::POOL_DESTROY);
        teardown(raw.get(), true);
    }

    pub fn pool_clear(raw: RawHandle) {
        log(names::POOL_CLEAR);
        teardown(raw.get(), false);
    }

    pub fn palloc(raw: RawHandle, size: usize, _align: usize) -> Option<usize> {
        log(names::PALLOC);
        store(raw, vec![0xEE; size].into_boxed_slice())
    }

    pub fn pcalloc(raw: RawHandle, size: usize) -> Option<usize> {
        log(names::PCALLOC);
        store(raw, vec![0; size].into_boxed_slice())
    }

    pub fn free(_raw: RawHandle, _addr: usize, _size: usize) {
        log(names::FREE);
    }

    pub fn cleanup_register(raw: RawHandle, data: usize, cb: RawCleanup) {
        log(names::CLEANUP_REGISTER);
        with(raw, |p| p.cleanups.push((data, cb)));
    }

    pub fn pre_cleanup_register(raw: RawHandle, data: usize, cb: RawCleanup) {
        log(names::PRE_CLEANUP_REGISTER);
        with(raw, |p| p.cleanups.push((data, cb)));
    }

    pub fn cleanup_kill(raw: RawHandle, data: usize, cb: RawCleanup) {
        log(names::CLEANUP_KILL);
        with(raw, |p| {
            p.cleanups
                .retain(|&(d, c)| !(d == data && c as usize == cb as usize));
        });
    }

    pub fn userdata_set(raw: RawHandle, key: &str, data: usize, cb: Option<RawCleanup>) -> bool {
        log(names::USERDATA_SET);
        with(raw, |p| p.userdata.insert(key.to_owned(), (data, cb))).is_some()
    }

    pub fn userdata_setn(
        raw: RawHandle,
        key: &'static str,
        data: usize,
        cb: Option<RawCleanup>,
    ) -> bool {
        log(names::USERDATA_SETN);
        with(raw, |p| p.userdata.insert(key.to_owned(), (data, cb))).is_some()
    }

    pub fn userdata_get(raw: RawHandle, key: &str) -> Option<usize> {
        log(names::USERDATA_GET);
        with(raw, |p| p.userdata.get(key).map(|(data, _)| *data)).flatten()
    }

    pub fn memdup(raw: RawHandle, data: &[u8]) -> Option<usize> {
        log(names::MEMDUP);
        store(raw, data.into())
    }

    pub fn strdup(raw: RawHandle, s: &str) -> Option<usize> {
        log(names::STRDUP);
        store(raw, s.as_bytes().into())
    }

    pub fn tag(raw: RawHandle, tag: &str) {
        log(names::TAG);
        with(raw, |p| p.tag = Some(tag.to_owned()));
    }

    pub fn get_tag(raw: RawHandle) -> Option<String> {
        log(names::GET_TAG);
        with(raw, |p| p.tag.clone()).flatten()
    }

    pub fn set_info(raw: RawHandle, file: &'static str, line: u32) {
        log(names::SET_INFO);
        with(raw, |p| p.info = Some((file, line)));
    }

    /// Creation site recorded for `raw`, read without going through a symbol.
    pub fn info_of(raw: RawHandle) -> Option<(&'static str, u32)> {
        with(raw, |p| p.info).flatten()
    }

    pub fn allocator_create() -> Option<RawHandle> {
        log(names::ALLOCATOR_CREATE);
        RawHandle::new(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn allocator_destroy(_raw: RawHandle) {
        log(names::ALLOCATOR_DESTROY);
    }

    pub fn allocator_max_free_set(_raw: RawHandle, bytes: usize) {
        log(names::ALLOCATOR_MAX_FREE_SET);
        MAX_FREE.store(bytes, Ordering::Relaxed);
    }

    pub fn exports() -> Vec<(&'static str, Symbol)> {
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
            (
                names::ALLOCATOR_MAX_FREE_SET,
                Symbol::AllocatorMaxFree(allocator_max_free_set),
            ),
        ]
    }
}

static CLEANUP_SUM: AtomicUsize = AtomicUsize::new(0);

fn add_to_sum(data: usize) {
    CLEANUP_SUM.fetch_add(data, Ordering::SeqCst);
}

#[test]
fn foreign_pool_routes_every_call_to_backend() {
    let registry = ExportRegistry::new();
    registry.publish_all(fake::exports());
    let interface = Arc::new(ForeignInterface::load(&registry));
    assert!(interface.is_ready());

    let allocator = AllocatorHandle::foreign(&interface).unwrap();
    assert_eq!(allocator.kind(), PoolKind::Foreign);
    allocator.set_max_free(4096).unwrap();
    assert_eq!(fake::MAX_FREE.load(Ordering::Relaxed), 4096);

    let pool = PoolHandle::foreign(&interface, Some(&allocator)).unwrap();
    assert_eq!(pool.kind(), PoolKind::Foreign);
    assert!(pool.as_native().is_none());

    let mem = pool.palloc(32).unwrap();
    assert!(matches!(mem, Memory::Foreign(addr) if addr != 0));
    assert!(mem.as_native().is_none());
    assert!(!pool.free(&mem, 32).unwrap());
    pool.calloc(16).unwrap();
    pool.memdup(b"bytes").unwrap();
    pool.strdup("text").unwrap();
    assert_eq!(pool.tag().unwrap(), None);
    pool.set_tag("fake").unwrap();
    assert_eq!(pool.tag().unwrap().as_deref(), Some("fake"));
    let PoolHandle::Foreign(foreign) = &pool else {
        panic!("expected a foreign handle");
    };
    let site = PoolInfo::here();
    pool.set_info(site).unwrap();
    assert_eq!(fake::info_of(foreign.raw()), Some((site.file, site.line)));

    pool.userdata_set("answer", 42, None).unwrap();
    pool.userdata_setn("static", 7, Some(add_to_sum)).unwrap();
    assert_eq!(pool.userdata_get("answer").unwrap(), Some(42));
    assert_eq!(pool.userdata_get("missing").unwrap(), None);

    pool.cleanup_register(100, add_to_sum).unwrap();
    pool.pre_cleanup_register(1000, add_to_sum).unwrap();
    pool.cleanup_register(5, add_to_sum).unwrap();
    pool.cleanup_kill(5, add_to_sum).unwrap();

    let child = pool.create_child().unwrap();
    assert_eq!(child.kind(), PoolKind::Foreign);
    child.cleanup_register(20_000, add_to_sum).unwrap();

    pool.clear().unwrap();
    assert_eq!(CLEANUP_SUM.load(Ordering::SeqCst), 21_107);

    pool.destroy().unwrap();
    allocator.destroy().unwrap();

    let calls = fake::CALLS.lock().clone();
    for name in SYMBOL_NAMES {
        assert!(calls.contains(&name), "{name} never reached the backend");
    }
    assert_eq!(calls.first(), Some(&names::ALLOCATOR_CREATE));
    assert_eq!(calls.last(), Some(&names::ALLOCATOR_DESTROY));
}

#[test]
fn missing_symbol_leaves_backend_inert() {
    let registry = ExportRegistry::new();
    registry.publish_all(fake::exports());
    assert!(registry.withdraw(names::USERDATA_SETN));

    match ForeignTable::resolve(&registry) {
        Err(ShimError::MissingSymbols(missing)) => assert_eq!(missing, [names::USERDATA_SETN]),
        other => panic!("unexpected: {other:?}"),
    }

    let interface = Arc::new(ForeignInterface::load(&registry));
    assert!(!interface.is_ready());
    assert!(matches!(
        PoolHandle::foreign(&interface, None),
        Err(ShimError::BackendUnavailable(_))
    ));

    let native = PoolHandle::native(None).unwrap();
    assert_eq!(native.kind(), PoolKind::Native);
    assert!(native.palloc(8).is_ok());
    native.destroy().unwrap();
}

#[test]
fn wrong_signature_is_rejected() {
    let registry = ExportRegistry::new();
    registry.publish_all(fake::exports());
    registry.publish(names::PALLOC, Symbol::PoolOp(fake::pool_clear));
    assert!(matches!(
        ForeignTable::resolve(&registry),
        Err(ShimError::SignatureMismatch(name)) if name == names::PALLOC
    ));
}

#[test]
fn native_exports_round_trip_through_foreign_path() {
    let registry = ExportRegistry::new();
    publish_native(&registry);
    let interface = Arc::new(ForeignInterface::load(&registry));
    assert!(interface.is_ready());

    let handle = PoolHandle::foreign(&interface, None).unwrap();
    assert_eq!(handle.kind(), PoolKind::Foreign);
    let PoolHandle::Foreign(foreign) = &handle else {
        panic!("expected a foreign handle");
    };
    let native: Pool = lookup_pool(foreign.raw()).unwrap();

    handle.set_tag("exported").unwrap();
    assert_eq!(native.tag().unwrap().as_deref(), Some("exported"));
    assert_eq!(handle.tag().unwrap().as_deref(), Some("exported"));
    let site = PoolInfo::here();
    handle.set_info(site).unwrap();
    assert_eq!(native.info().unwrap(), Some(site));

    handle.userdata_set("word", 99, None).unwrap();
    assert_eq!(handle.userdata_get("word").unwrap(), Some(99));

    let child = handle.create_child().unwrap();
    let PoolHandle::Foreign(foreign_child) = &child else {
        panic!("expected a foreign handle");
    };
    let native_child = lookup_pool(foreign_child.raw()).unwrap();
    assert!(native.is_ancestor(&native_child).unwrap());

    let big = handle.palloc(128 * 1024).unwrap();
    assert!(!handle.free(&big, 128 * 1024).unwrap());
    handle.palloc(100 * 1024).unwrap();
    assert_eq!(native.stats().unwrap().large.hits, 1);

    handle.destroy().unwrap();
    assert!(!native.is_alive());
    assert!(!native_child.is_alive());
}
