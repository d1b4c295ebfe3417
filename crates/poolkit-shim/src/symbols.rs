//! Foreign function table, symbol names and symbol sources.
//!
//! The table holds one optional function pointer per required symbol.
//! `None` is the unresolved sentinel: a table with any `None` slot fails
//! validation and is never used for dispatch.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use poolkit_core::RawCleanup;
use tracing::debug;

use crate::error::ShimError;
use crate::handle::RawHandle;

/// Create a pool under an optional parent and allocator.
pub type PoolCreateFn = fn(Option<RawHandle>, Option<RawHandle>) -> Option<RawHandle>;
/// Destroy or clear a pool.
pub type PoolOpFn = fn(RawHandle);
/// Allocate `size` bytes at `align`; returns the address.
pub type PallocFn = fn(RawHandle, usize, usize) -> Option<usize>;
/// Allocate `size` zeroed bytes; returns the address.
pub type PcallocFn = fn(RawHandle, usize) -> Option<usize>;
/// Advisory free of `(address, size)`.
pub type FreeFn = fn(RawHandle, usize, usize);
/// Register, pre-register or kill a `(data, callback)` cleanup.
pub type CleanupFn = fn(RawHandle, usize, RawCleanup);
/// Attach a word under a copied key with an optional cleanup.
pub type UserdataSetFn = fn(RawHandle, &str, usize, Option<RawCleanup>) -> bool;
/// Attach a word under a borrowed key with an optional cleanup.
pub type UserdataSetnFn = fn(RawHandle, &'static str, usize, Option<RawCleanup>) -> bool;
/// Fetch a word by key.
pub type UserdataGetFn = fn(RawHandle, &str) -> Option<usize>;
/// Copy bytes into a pool; returns the address.
pub type MemdupFn = fn(RawHandle, &[u8]) -> Option<usize>;
/// Copy a string into a pool; returns the address.
pub type StrdupFn = fn(RawHandle, &str) -> Option<usize>;
/// Set a pool's debug tag.
pub type TagFn = fn(RawHandle, &str);
/// Read a pool's debug tag.
pub type GetTagFn = fn(RawHandle) -> Option<String>;
/// Record the `(file, line)` a pool was created from.
pub type SetInfoFn = fn(RawHandle, &'static str, u32);
/// Create an allocator.
pub type AllocatorCreateFn = fn() -> Option<RawHandle>;
/// Destroy an allocator.
pub type AllocatorDestroyFn = fn(RawHandle);
/// Set an allocator's free-byte budget.
pub type AllocatorMaxFreeFn = fn(RawHandle, usize);

/// Symbol names every backend must export.
pub mod names {
    pub const POOL_CREATE: &str = "poolkit_pool_create";
    pub const POOL_DESTROY: &str = "poolkit_pool_destroy";
    pub const POOL_CLEAR: &str = "poolkit_pool_clear";
    pub const PALLOC: &str = "poolkit_palloc";
    pub const PCALLOC: &str = "poolkit_pcalloc";
    pub const FREE: &str = "poolkit_free";
    pub const CLEANUP_REGISTER: &str = "poolkit_cleanup_register";
    pub const PRE_CLEANUP_REGISTER: &str = "poolkit_pre_cleanup_register";
    pub const CLEANUP_KILL: &str = "poolkit_cleanup_kill";
    pub const USERDATA_SET: &str = "poolkit_userdata_set";
    pub const USERDATA_SETN: &str = "poolkit_userdata_setn";
    pub const USERDATA_GET: &str = "poolkit_userdata_get";
    pub const MEMDUP: &str = "poolkit_memdup";
    pub const STRDUP: &str = "poolkit_strdup";
    pub const TAG: &str = "poolkit_pool_tag";
    pub const GET_TAG: &str = "poolkit_pool_get_tag";
    pub const SET_INFO: &str = "poolkit_pool_set_info";
    pub const ALLOCATOR_CREATE: &str = "poolkit_allocator_create";
    pub const ALLOCATOR_DESTROY: &str = "poolkit_allocator_destroy";
    pub const ALLOCATOR_MAX_FREE_SET: &str = "poolkit_allocator_max_free_set";
}

/// Every required symbol, in table order.
pub const SYMBOL_NAMES: [&str; 20] = [
    names::POOL_CREATE,
    names::POOL_DESTROY,
    names::POOL_CLEAR,
    names::PALLOC,
    names::PCALLOC,
    names::FREE,
    names::CLEANUP_REGISTER,
    names::PRE_CLEANUP_REGISTER,
    names::CLEANUP_KILL,
    names::USERDATA_SET,
    names::USERDATA_SETN,
    names::USERDATA_GET,
    names::MEMDUP,
    names::STRDUP,
    names::TAG,
    names::GET_TAG,
    names::SET_INFO,
    names::ALLOCATOR_CREATE,
    names::ALLOCATOR_DESTROY,
    names::ALLOCATOR_MAX_FREE_SET,
];

/// A resolved symbol: a typed function pointer.
#[derive(Debug, Clone, Copy)]
pub enum Symbol {
    /// Pool creation.
    PoolCreate(PoolCreateFn),
    /// Pool destroy or clear.
    PoolOp(PoolOpFn),
    /// Aligned allocation.
    Palloc(PallocFn),
    /// Zeroed allocation.
    Pcalloc(PcallocFn),
    /// Advisory free.
    Free(FreeFn),
    /// Cleanup registration or removal.
    Cleanup(CleanupFn),
    /// Userdata set with copied key.
    UserdataSet(UserdataSetFn),
    /// Userdata set with borrowed key.
    UserdataSetn(UserdataSetnFn),
    /// Userdata lookup.
    UserdataGet(UserdataGetFn),
    /// Byte copy.
    Memdup(MemdupFn),
    /// String copy.
    Strdup(StrdupFn),
    /// Tagging.
    Tag(TagFn),
    /// Tag lookup.
    GetTag(GetTagFn),
    /// Creation site.
    SetInfo(SetInfoFn),
    /// Allocator creation.
    AllocatorCreate(AllocatorCreateFn),
    /// Allocator destruction.
    AllocatorDestroy(AllocatorDestroyFn),
    /// Allocator budget.
    AllocatorMaxFree(AllocatorMaxFreeFn),
}

/// Resolved foreign functions.
#[derive(Debug, Default, Clone)]
pub struct ForeignTable {
    pub(crate) pool_create: Option<PoolCreateFn>,
    pub(crate) pool_destroy: Option<PoolOpFn>,
    pub(crate) pool_clear: Option<PoolOpFn>,
    pub(crate) palloc: Option<PallocFn>,
    pub(crate) pcalloc: Option<PcallocFn>,
    pub(crate) free: Option<FreeFn>,
    pub(crate) cleanup_register: Option<CleanupFn>,
    pub(crate) pre_cleanup_register: Option<CleanupFn>,
    pub(crate) cleanup_kill: Option<CleanupFn>,
    pub(crate) userdata_set: Option<UserdataSetFn>,
    pub(crate) userdata_setn: Option<UserdataSetnFn>,
    pub(crate) userdata_get: Option<UserdataGetFn>,
    pub(crate) memdup: Option<MemdupFn>,
    pub(crate) strdup: Option<StrdupFn>,
    pub(crate) tag: Option<TagFn>,
    pub(crate) get_tag: Option<GetTagFn>,
    pub(crate) set_info: Option<SetInfoFn>,
    pub(crate) allocator_create: Option<AllocatorCreateFn>,
    pub(crate) allocator_destroy: Option<AllocatorDestroyFn>,
    pub(crate) allocator_max_free_set: Option<AllocatorMaxFreeFn>,
}

impl ForeignTable {
    /// Resolve every required symbol from `source`.
    ///
    /// Fails with the full list of unresolved names, or with the first
    /// symbol whose shape does not match its slot.
    pub fn resolve(source: &dyn SymbolSource) -> Result<Self, ShimError> {
        let mut table = Self::default();
        let mut missing = Vec::new();
        for name in SYMBOL_NAMES {
            match source.lookup(name) {
                Some(symbol) => table.install(name, symbol)?,
                None => missing.push(name),
            }
        }
        if !missing.is_empty() {
            return Err(ShimError::MissingSymbols(missing));
        }
        table.validate()?;
        debug!(symbols = SYMBOL_NAMES.len(), "foreign table resolved");
        Ok(table)
    }

    fn install(&mut self, name: &'static str, symbol: Symbol) -> Result<(), ShimError> {
        use names as n;
        match (name, symbol) {
            (n::POOL_CREATE, Symbol::PoolCreate(f)) => self.pool_create = Some(f),
            (n::POOL_DESTROY, Symbol::PoolOp(f)) => self.pool_destroy = Some(f),
            (n::POOL_CLEAR, Symbol::PoolOp(f)) => self.pool_clear = Some(f),
            (n::PALLOC, Symbol::Palloc(f)) => self.palloc = Some(f),
            (n::PCALLOC, Symbol::Pcalloc(f)) => self.pcalloc = Some(f),
            (n::FREE, Symbol::Free(f)) => self.free = Some(f),
            (n::CLEANUP_REGISTER, Symbol::Cleanup(f)) => self.cleanup_register = Some(f),
            (n::PRE_CLEANUP_REGISTER, Symbol::Cleanup(f)) => self.pre_cleanup_register = Some(f),
            (n::CLEANUP_KILL, Symbol::Cleanup(f)) => self.cleanup_kill = Some(f),
            (n::USERDATA_SET, Symbol::UserdataSet(f)) => self.userdata_set = Some(f),
            (n::USERDATA_SETN, Symbol::UserdataSetn(f)) => self.userdata_setn = Some(f),
            (n::USERDATA_GET, Symbol::UserdataGet(f)) => self.userdata_get = Some(f),
            (n::MEMDUP, Symbol::Memdup(f)) => self.memdup = Some(f),
            (n::STRDUP, Symbol::Strdup(f)) => self.strdup = Some(f),
            (n::TAG, Symbol::Tag(f)) => self.tag = Some(f),
            (n::GET_TAG, Symbol::GetTag(f)) => self.get_tag = Some(f),
            (n::SET_INFO, Symbol::SetInfo(f)) => self.set_info = Some(f),
            (n::ALLOCATOR_CREATE, Symbol::AllocatorCreate(f)) => self.allocator_create = Some(f),
            (n::ALLOCATOR_DESTROY, Symbol::AllocatorDestroy(f)) => {
                self.allocator_destroy = Some(f);
            }
            (n::ALLOCATOR_MAX_FREE_SET, Symbol::AllocatorMaxFree(f)) => {
                self.allocator_max_free_set = Some(f);
            }
            _ => return Err(ShimError::SignatureMismatch(name)),
        }
        Ok(())
    }

    /// Names of slots still holding the unresolved sentinel.
    #[must_use]
    pub fn unresolved(&self) -> Vec<&'static str> {
        let slots = [
            self.pool_create.is_some(),
            self.pool_destroy.is_some(),
            self.pool_clear.is_some(),
            self.palloc.is_some(),
            self.pcalloc.is_some(),
            self.free.is_some(),
            self.cleanup_register.is_some(),
            self.pre_cleanup_register.is_some(),
            self.cleanup_kill.is_some(),
            self.userdata_set.is_some(),
            self.userdata_setn.is_some(),
            self.userdata_get.is_some(),
            self.memdup.is_some(),
            self.strdup.is_some(),
            self.tag.is_some(),
            self.get_tag.is_some(),
            self.set_info.is_some(),
            self.allocator_create.is_some(),
            self.allocator_destroy.is_some(),
            self.allocator_max_free_set.is_some(),
        ];
        SYMBOL_NAMES
            .iter()
            .zip(slots)
            .filter(|(_, resolved)| !resolved)
            .map(|(name, _)| *name)
            .collect()
    }

    /// Check that no slot holds the sentinel.
    pub fn validate(&self) -> Result<(), ShimError> {
        let unresolved = self.unresolved();
        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(ShimError::MissingSymbols(unresolved))
        }
    }
}

/// Something symbols can be looked up in by name.
pub trait SymbolSource {
    /// Resolve `name`, if exported.
    fn lookup(&self, name: &str) -> Option<Symbol>;
}

impl SymbolSource for HashMap<&'static str, Symbol> {
    fn lookup(&self, name: &str) -> Option<Symbol> {
        self.get(name).copied()
    }
}

/// Name-to-function map that linked implementations publish into.
///
/// The process-wide instance returned by [`ExportRegistry::global`] stands
/// for the symbols of the running image.
#[derive(Debug, Default)]
pub struct ExportRegistry {
    symbols: RwLock<HashMap<&'static str, Symbol>>,
}

impl ExportRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<ExportRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Export one symbol, replacing any previous export of that name.
    pub fn publish(&self, name: &'static str, symbol: Symbol) {
        self.symbols.write().insert(name, symbol);
    }

    /// Export a batch of symbols.
    pub fn publish_all<I>(&self, symbols: I)
    where
        I: IntoIterator<Item = (&'static str, Symbol)>,
    {
        self.symbols.write().extend(symbols);
    }

    /// Remove an export; returns whether it existed.
    pub fn withdraw(&self, name: &str) -> bool {
        self.symbols.write().remove(name).is_some()
    }

    /// Remove every export.
    pub fn clear(&self) {
        self.symbols.write().clear();
    }

    /// Number of exports.
    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    /// Whether nothing is exported.
    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }
}

impl SymbolSource for ExportRegistry {
    fn lookup(&self, name: &str) -> Option<Symbol> {
        self.symbols.read().get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(_: Option<RawHandle>, _: Option<RawHandle>) -> Option<RawHandle> {
        RawHandle::new(1)
    }

    fn op(_: RawHandle) {}

    #[test]
    fn names_are_unique() {
        let mut sorted = SYMBOL_NAMES.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), SYMBOL_NAMES.len());
    }

    #[test]
    fn empty_source_reports_every_symbol() {
        let registry = ExportRegistry::new();
        match ForeignTable::resolve(&registry) {
            Err(ShimError::MissingSymbols(missing)) => assert_eq!(missing.len(), SYMBOL_NAMES.len()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let mut source: HashMap<&'static str, Symbol> = HashMap::new();
        source.insert(names::POOL_CREATE, Symbol::PoolOp(op));
        assert!(matches!(
            ForeignTable::resolve(&source),
            Err(ShimError::SignatureMismatch(names::POOL_CREATE))
        ));
    }

    #[test]
    fn partial_table_lists_remaining_sentinels() {
        let registry = ExportRegistry::new();
        registry.publish(names::POOL_CREATE, Symbol::PoolCreate(create));
        registry.publish(names::POOL_DESTROY, Symbol::PoolOp(op));
        match ForeignTable::resolve(&registry) {
            Err(ShimError::MissingSymbols(missing)) => {
                assert_eq!(missing.len(), SYMBOL_NAMES.len() - 2);
                assert!(!missing.contains(&names::POOL_CREATE));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn default_table_is_invalid() {
        let table = ForeignTable::default();
        assert_eq!(table.unresolved().len(), SYMBOL_NAMES.len());
        assert!(table.validate().is_err());
    }

    #[test]
    fn registry_publish_and_withdraw() {
        let registry = ExportRegistry::new();
        assert!(registry.is_empty());
        registry.publish_all([
            (names::POOL_DESTROY, Symbol::PoolOp(op)),
            (names::POOL_CLEAR, Symbol::PoolOp(op)),
        ]);
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup(names::POOL_CLEAR).is_some());
        assert!(registry.withdraw(names::POOL_CLEAR));
        assert!(!registry.withdraw(names::POOL_CLEAR));
        registry.clear();
        assert!(registry.is_empty());
    }
}
