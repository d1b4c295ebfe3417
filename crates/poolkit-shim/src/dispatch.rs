//! Dual dispatch over native and foreign handles.
//!
//! The kind of a handle is fixed when it is created. Native handles go
//! straight to `poolkit_core`; foreign handles are forwarded to the
//! resolved function table of the interface they were created from.

use std::rc::Rc;
use std::sync::Arc;

use poolkit_alloc::{Allocator, AllocatorConfig};
use poolkit_core::{Allocation, Pool, PoolError, PoolInfo, RawCleanup};
use tracing::debug;

use crate::error::ShimError;
use crate::handle::{PoolKind, RawData, RawHandle};
use crate::loader::ForeignInterface;
use crate::symbols::names;

/// Memory handed out through a [`PoolHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    /// Native allocation, reachable through [`Pool::bytes`].
    Native(Allocation),
    /// Address returned by the foreign backend.
    Foreign(usize),
}

impl Memory {
    /// Address of the first byte.
    pub fn addr(&self) -> usize {
        match self {
            Self::Native(alloc) => alloc.addr(),
            Self::Foreign(addr) => *addr,
        }
    }

    /// The native allocation, if any.
    pub fn as_native(&self) -> Option<&Allocation> {
        match self {
            Self::Native(alloc) => Some(alloc),
            Self::Foreign(_) => None,
        }
    }
}

/// Pool owned by the foreign backend.
#[derive(Debug, Clone)]
pub struct ForeignPool {
    interface: Arc<ForeignInterface>,
    raw: RawHandle,
}

impl ForeignPool {
    /// The raw handle the backend returned.
    pub fn raw(&self) -> RawHandle {
        self.raw
    }
}

/// Allocator owned by the foreign backend.
#[derive(Debug, Clone)]
pub struct ForeignAllocator {
    interface: Arc<ForeignInterface>,
    raw: RawHandle,
}

impl ForeignAllocator {
    /// The raw handle the backend returned.
    pub fn raw(&self) -> RawHandle {
        self.raw
    }
}

/// Allocator of either kind.
#[derive(Debug, Clone)]
pub enum AllocatorHandle {
    /// Native allocator.
    Native(Arc<Allocator>),
    /// Foreign allocator.
    Foreign(ForeignAllocator),
}

impl AllocatorHandle {
    /// Create a native allocator.
    pub fn native(config: AllocatorConfig) -> Result<Self, ShimError> {
        let allocator = Allocator::new(config).map_err(PoolError::from)?;
        Ok(Self::Native(Arc::new(allocator)))
    }

    /// Create an allocator through the foreign backend.
    pub fn foreign(interface: &Arc<ForeignInterface>) -> Result<Self, ShimError> {
        let table = interface.table(names::ALLOCATOR_CREATE)?;
        let create = table
            .allocator_create
            .ok_or(ShimError::ForeignFailure(names::ALLOCATOR_CREATE))?;
        let raw = create().ok_or(ShimError::ForeignFailure(names::ALLOCATOR_CREATE))?;
        Ok(Self::Foreign(ForeignAllocator {
            interface: Arc::clone(interface),
            raw,
        }))
    }

    /// Which implementation backs this handle.
    pub fn kind(&self) -> PoolKind {
        match self {
            Self::Native(_) => PoolKind::Native,
            Self::Foreign(_) => PoolKind::Foreign,
        }
    }

    /// Set the free-byte budget.
    pub fn set_max_free(&self, bytes: usize) -> Result<(), ShimError> {
        match self {
            Self::Native(allocator) => {
                allocator.set_max_free(bytes);
                Ok(())
            }
            Self::Foreign(f) => {
                let table = f.interface.table(names::ALLOCATOR_MAX_FREE_SET)?;
                let set = table
                    .allocator_max_free_set
                    .ok_or(ShimError::ForeignFailure(names::ALLOCATOR_MAX_FREE_SET))?;
                set(f.raw, bytes);
                Ok(())
            }
        }
    }

    /// Release the allocator. Native allocators go away with their last
    /// reference; foreign ones are destroyed by the backend.
    pub fn destroy(self) -> Result<(), ShimError> {
        match self {
            Self::Native(allocator) => {
                drop(allocator);
                Ok(())
            }
            Self::Foreign(f) => {
                let table = f.interface.table(names::ALLOCATOR_DESTROY)?;
                let destroy = table
                    .allocator_destroy
                    .ok_or(ShimError::ForeignFailure(names::ALLOCATOR_DESTROY))?;
                destroy(f.raw);
                Ok(())
            }
        }
    }
}

/// Pool of either kind.
#[derive(Debug, Clone)]
pub enum PoolHandle {
    /// Native pool.
    Native(Pool),
    /// Foreign pool.
    Foreign(ForeignPool),
}

impl From<Pool> for PoolHandle {
    fn from(pool: Pool) -> Self {
        Self::Native(pool)
    }
}

macro_rules! foreign_fn {
    ($pool:expr, $slot:ident, $name:expr) => {{
        let table = $pool.interface.table($name)?;
        table.$slot.ok_or(ShimError::ForeignFailure($name))?
    }};
}

impl PoolHandle {
    /// Create a native root pool, on `allocator` if given.
    pub fn native(allocator: Option<&AllocatorHandle>) -> Result<Self, ShimError> {
        let pool = match allocator {
            None => Pool::new()?,
            Some(AllocatorHandle::Native(a)) => Pool::with_allocator(Arc::clone(a))?,
            Some(other) => {
                return Err(ShimError::KindMismatch {
                    expected: PoolKind::Native,
                    found: other.kind(),
                })
            }
        };
        Ok(Self::Native(pool))
    }

    /// Create a root pool through the foreign backend.
    pub fn foreign(
        interface: &Arc<ForeignInterface>,
        allocator: Option<&AllocatorHandle>,
    ) -> Result<Self, ShimError> {
        let allocator = match allocator {
            None => None,
            Some(AllocatorHandle::Foreign(a)) => Some(a.raw),
            Some(other) => {
                return Err(ShimError::KindMismatch {
                    expected: PoolKind::Foreign,
                    found: other.kind(),
                })
            }
        };
        let table = interface.table(names::POOL_CREATE)?;
        let create = table
            .pool_create
            .ok_or(ShimError::ForeignFailure(names::POOL_CREATE))?;
        let raw = create(None, allocator).ok_or(ShimError::ForeignFailure(names::POOL_CREATE))?;
        debug!(%raw, "foreign pool created");
        Ok(Self::Foreign(ForeignPool {
            interface: Arc::clone(interface),
            raw,
        }))
    }

    /// Tag check: which implementation backs this handle.
    pub fn kind(&self) -> PoolKind {
        match self {
            Self::Native(_) => PoolKind::Native,
            Self::Foreign(_) => PoolKind::Foreign,
        }
    }

    /// The native pool, if this is one.
    pub fn as_native(&self) -> Option<&Pool> {
        match self {
            Self::Native(pool) => Some(pool),
            Self::Foreign(_) => None,
        }
    }

    /// Create a managed child of the same kind.
    pub fn create_child(&self) -> Result<Self, ShimError> {
        match self {
            Self::Native(pool) => Ok(Self::Native(pool.create_child()?)),
            Self::Foreign(f) => {
                let create = foreign_fn!(f, pool_create, names::POOL_CREATE);
                let raw = create(Some(f.raw), None)
                    .ok_or(ShimError::ForeignFailure(names::POOL_CREATE))?;
                Ok(Self::Foreign(ForeignPool {
                    interface: Arc::clone(&f.interface),
                    raw,
                }))
            }
        }
    }

    /// Destroy the pool and its descendants.
    pub fn destroy(&self) -> Result<(), ShimError> {
        match self {
            Self::Native(pool) => Ok(pool.destroy()?),
            Self::Foreign(f) => {
                let destroy = foreign_fn!(f, pool_destroy, names::POOL_DESTROY);
                destroy(f.raw);
                Ok(())
            }
        }
    }

    /// Clear the pool, keeping it usable.
    pub fn clear(&self) -> Result<(), ShimError> {
        match self {
            Self::Native(pool) => Ok(pool.clear()?),
            Self::Foreign(f) => {
                let clear = foreign_fn!(f, pool_clear, names::POOL_CLEAR);
                clear(f.raw);
                Ok(())
            }
        }
    }

    /// Allocate `size` bytes at `align`.
    pub fn palloc_aligned(&self, size: usize, align: usize) -> Result<Memory, ShimError> {
        match self {
            Self::Native(pool) => Ok(Memory::Native(pool.palloc_aligned(size, align)?)),
            Self::Foreign(f) => {
                let palloc = foreign_fn!(f, palloc, names::PALLOC);
                palloc(f.raw, size, align)
                    .map(Memory::Foreign)
                    .ok_or(ShimError::ForeignFailure(names::PALLOC))
            }
        }
    }

    /// Allocate `size` bytes at the default alignment.
    pub fn palloc(&self, size: usize) -> Result<Memory, ShimError> {
        match self {
            Self::Native(pool) => Ok(Memory::Native(pool.palloc(size)?)),
            Self::Foreign(_) => self.palloc_aligned(size, poolkit_core::constants::DEFAULT_ALIGN),
        }
    }

    /// Allocate `size` zeroed bytes.
    pub fn calloc(&self, size: usize) -> Result<Memory, ShimError> {
        match self {
            Self::Native(pool) => Ok(Memory::Native(pool.calloc(size)?)),
            Self::Foreign(f) => {
                let pcalloc = foreign_fn!(f, pcalloc, names::PCALLOC);
                pcalloc(f.raw, size)
                    .map(Memory::Foreign)
                    .ok_or(ShimError::ForeignFailure(names::PCALLOC))
            }
        }
    }

    /// Advisory free; returns whether native storage was recycled.
    pub fn free(&self, memory: &Memory, size: usize) -> Result<bool, ShimError> {
        match (self, memory) {
            (Self::Native(pool), Memory::Native(alloc)) => Ok(pool.free(alloc, size)?),
            (Self::Foreign(f), Memory::Foreign(addr)) => {
                let free = foreign_fn!(f, free, names::FREE);
                free(f.raw, *addr, size);
                Ok(false)
            }
            (Self::Native(_), Memory::Foreign(_)) => Err(ShimError::KindMismatch {
                expected: PoolKind::Native,
                found: PoolKind::Foreign,
            }),
            (Self::Foreign(_), Memory::Native(_)) => Err(ShimError::KindMismatch {
                expected: PoolKind::Foreign,
                found: PoolKind::Native,
            }),
        }
    }

    /// Register `cb(data)` to run on clear/destroy.
    pub fn cleanup_register(&self, data: usize, cb: RawCleanup) -> Result<(), ShimError> {
        match self {
            Self::Native(pool) => {
                pool.cleanup_register_raw(data, cb)?;
                Ok(())
            }
            Self::Foreign(f) => {
                let register = foreign_fn!(f, cleanup_register, names::CLEANUP_REGISTER);
                register(f.raw, data, cb);
                Ok(())
            }
        }
    }

    /// Register `cb(data)` to run before ordinary cleanups.
    pub fn pre_cleanup_register(&self, data: usize, cb: RawCleanup) -> Result<(), ShimError> {
        match self {
            Self::Native(pool) => {
                pool.pre_cleanup_register_raw(data, cb)?;
                Ok(())
            }
            Self::Foreign(f) => {
                let register = foreign_fn!(f, pre_cleanup_register, names::PRE_CLEANUP_REGISTER);
                register(f.raw, data, cb);
                Ok(())
            }
        }
    }

    /// Remove every `(data, cb)` registration without running it.
    pub fn cleanup_kill(&self, data: usize, cb: RawCleanup) -> Result<(), ShimError> {
        match self {
            Self::Native(pool) => {
                pool.cleanup_kill_raw(data, cb)?;
                Ok(())
            }
            Self::Foreign(f) => {
                let kill = foreign_fn!(f, cleanup_kill, names::CLEANUP_KILL);
                kill(f.raw, data, cb);
                Ok(())
            }
        }
    }

    /// Attach `data` under a copy of `key`.
    pub fn userdata_set(
        &self,
        key: &str,
        data: usize,
        cleanup: Option<RawCleanup>,
    ) -> Result<(), ShimError> {
        match self {
            Self::Native(pool) => {
                pool.userdata_set(key, Rc::new(RawData(data)), raw_userdata_cleanup(cleanup))?;
                Ok(())
            }
            Self::Foreign(f) => {
                let set = foreign_fn!(f, userdata_set, names::USERDATA_SET);
                if set(f.raw, key, data, cleanup) {
                    Ok(())
                } else {
                    Err(ShimError::ForeignFailure(names::USERDATA_SET))
                }
            }
        }
    }

    /// Attach `data` under `key` without copying it.
    pub fn userdata_setn(
        &self,
        key: &'static str,
        data: usize,
        cleanup: Option<RawCleanup>,
    ) -> Result<(), ShimError> {
        match self {
            Self::Native(pool) => {
                pool.userdata_setn(key, Rc::new(RawData(data)), raw_userdata_cleanup(cleanup))?;
                Ok(())
            }
            Self::Foreign(f) => {
                let setn = foreign_fn!(f, userdata_setn, names::USERDATA_SETN);
                if setn(f.raw, key, data, cleanup) {
                    Ok(())
                } else {
                    Err(ShimError::ForeignFailure(names::USERDATA_SETN))
                }
            }
        }
    }

    /// Fetch the word stored under `key`.
    pub fn userdata_get(&self, key: &str) -> Result<Option<usize>, ShimError> {
        match self {
            Self::Native(pool) => Ok(pool
                .userdata_get_as::<RawData>(key)?
                .map(|data| data.0)),
            Self::Foreign(f) => {
                let get = foreign_fn!(f, userdata_get, names::USERDATA_GET);
                Ok(get(f.raw, key))
            }
        }
    }

    /// Copy bytes into the pool.
    pub fn memdup(&self, data: &[u8]) -> Result<Memory, ShimError> {
        match self {
            Self::Native(pool) => Ok(Memory::Native(pool.memdup(data)?)),
            Self::Foreign(f) => {
                let memdup = foreign_fn!(f, memdup, names::MEMDUP);
                memdup(f.raw, data)
                    .map(Memory::Foreign)
                    .ok_or(ShimError::ForeignFailure(names::MEMDUP))
            }
        }
    }

    /// Copy a string into the pool.
    pub fn strdup(&self, s: &str) -> Result<Memory, ShimError> {
        match self {
            Self::Native(pool) => Ok(Memory::Native(pool.strdup(s)?)),
            Self::Foreign(f) => {
                let strdup = foreign_fn!(f, strdup, names::STRDUP);
                strdup(f.raw, s)
                    .map(Memory::Foreign)
                    .ok_or(ShimError::ForeignFailure(names::STRDUP))
            }
        }
    }

    /// Set the debug tag.
    pub fn set_tag(&self, tag: &str) -> Result<(), ShimError> {
        match self {
            Self::Native(pool) => Ok(pool.set_tag(tag)?),
            Self::Foreign(f) => {
                let set_tag = foreign_fn!(f, tag, names::TAG);
                set_tag(f.raw, tag);
                Ok(())
            }
        }
    }

    /// The debug tag, if set.
    pub fn tag(&self) -> Result<Option<String>, ShimError> {
        match self {
            Self::Native(pool) => Ok(pool.tag()?),
            Self::Foreign(f) => {
                let get_tag = foreign_fn!(f, get_tag, names::GET_TAG);
                Ok(get_tag(f.raw))
            }
        }
    }

    /// Record the creation site.
    pub fn set_info(&self, info: PoolInfo) -> Result<(), ShimError> {
        match self {
            Self::Native(pool) => Ok(pool.set_info(info)?),
            Self::Foreign(f) => {
                let set_info = foreign_fn!(f, set_info, names::SET_INFO);
                set_info(f.raw, info.file, info.line);
                Ok(())
            }
        }
    }
}

pub(crate) fn raw_userdata_cleanup(
    cleanup: Option<RawCleanup>,
) -> Option<poolkit_core::pool::UserdataCleanup> {
    cleanup.map(|cb| -> poolkit_core::pool::UserdataCleanup {
        Box::new(move |value: poolkit_core::pool::UserValue| {
            if let Some(data) = value.downcast_ref::<RawData>() {
                cb(data.0);
            }
        })
    })
}
