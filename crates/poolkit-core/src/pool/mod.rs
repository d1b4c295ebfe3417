//! Hierarchical memory pools.
//!
//! A [`Pool`] is a cheap, clonable handle to one node of a pool tree. Memory
//! is bump-allocated from a chain of blocks obtained from a shared
//! [`Allocator`] and is only given back in bulk, by [`Pool::clear`] or
//! [`Pool::destroy`]. Allocations are described by [`Allocation`] values and
//! read or written through checked accessors, so access to cleared storage
//! is reported instead of observed.
//!
//! Pools are single-threaded; the allocator underneath may be shared.

mod cleanup;
mod large;
mod tree;
mod userdata;

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt::{self, Write as _};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use poolkit_alloc::{Allocator, BlockId};
use serde::Serialize;
use tracing::{debug, warn};

pub use cleanup::{ChainKind, CleanupId, RawCleanup};
pub use large::LargeStats;
pub use tree::PoolId;
pub use userdata::UserValue;

use cleanup::CleanupEntry;
pub(crate) use tree::ReleaseQueue;
use tree::{clear_node, destroy_node, PoolNode, PoolTree, SharedTree};

use crate::error::PoolError;
use crate::options::PoolOptions;
use crate::runtime;

/// Cleanup invoked with the value it was registered alongside.
pub type UserdataCleanup = Box<dyn FnOnce(UserValue)>;

/// Description of one range handed out by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    block: BlockId,
    offset: usize,
    len: usize,
    addr: usize,
}

impl Allocation {
    /// Requested length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the allocation is zero-sized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte, valid until the owning pool is cleared.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Tenancy of the block the range lives in.
    #[must_use]
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Offset of the range inside its block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Source location a pool was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    /// Source file.
    pub file: &'static str,
    /// Line in `file`.
    pub line: u32,
}

impl PoolInfo {
    /// Location of the caller.
    #[track_caller]
    #[must_use]
    pub fn here() -> Self {
        let loc = std::panic::Location::caller();
        Self {
            file: loc.file(),
            line: loc.line(),
        }
    }
}

impl fmt::Display for PoolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Typed value living in a pool until its next clear.
pub struct PoolValue<T> {
    pool: PoolId,
    epoch: u64,
    slot: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for PoolValue<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PoolValue<T> {}

impl<T> fmt::Debug for PoolValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolValue")
            .field("pool", &self.pool)
            .field("epoch", &self.epoch)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Snapshot of one pool's bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Blocks in the chain, self block included.
    pub blocks: usize,
    /// Total capacity of the chain.
    pub capacity: usize,
    /// Bytes consumed in the chain, alignment padding included.
    pub used: usize,
    /// Bytes requested through `palloc` and friends since the last clear.
    pub bytes_handed: usize,
    /// Direct children.
    pub children: usize,
    /// Registered pre-cleanups.
    pub pre_cleanups: usize,
    /// Registered ordinary cleanups.
    pub cleanups: usize,
    /// Userdata keys.
    pub userdata_keys: usize,
    /// Typed values.
    pub values: usize,
    /// Large-block cache counters.
    pub large: LargeStats,
}

/// Handle to one pool in a pool tree.
#[derive(Clone)]
pub struct Pool {
    tree: SharedTree,
    id: PoolId,
}

impl Pool {
    /// Create an unmanaged root pool with its own allocator.
    pub fn new() -> Result<Self, PoolError> {
        Self::with_options(PoolOptions::default())
    }

    /// Create an unmanaged root pool with its own allocator and options.
    pub fn with_options(options: PoolOptions) -> Result<Self, PoolError> {
        Self::root(Arc::new(Allocator::default()), true, options)
    }

    /// Create an unmanaged root pool drawing from a shared allocator.
    pub fn with_allocator(allocator: Arc<Allocator>) -> Result<Self, PoolError> {
        Self::root(allocator, false, PoolOptions::default())
    }

    /// Create an unmanaged root pool drawing from a shared allocator.
    pub fn with_allocator_and_options(
        allocator: Arc<Allocator>,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        Self::root(allocator, false, options)
    }

    /// Create a root pool carrying a debug tag.
    pub fn tagged(tag: &str) -> Result<Self, PoolError> {
        let pool = Self::new()?;
        pool.set_tag(tag)?;
        Ok(pool)
    }

    fn root(
        allocator: Arc<Allocator>,
        owns_allocator: bool,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        let node = PoolNode::new(None, allocator, owns_allocator, options.normalize())?;
        let mut tree = PoolTree::new();
        let id = tree.insert(node);
        runtime::record_pool_created();
        debug!(owns_allocator, "root pool created");
        Ok(Self {
            tree: Rc::new(RefCell::new(tree)),
            id,
        })
    }

    /// Create a managed child sharing this pool's allocator.
    pub fn create_child(&self) -> Result<Self, PoolError> {
        self.spawn(None, None)
    }

    /// Create a managed child drawing from its own allocator.
    pub fn create_child_with_allocator(&self, allocator: Arc<Allocator>) -> Result<Self, PoolError> {
        self.spawn(Some(allocator), None)
    }

    /// Create a managed child with different options.
    pub fn create_child_with_options(&self, options: PoolOptions) -> Result<Self, PoolError> {
        self.spawn(None, Some(options))
    }

    fn spawn(
        &self,
        allocator: Option<Arc<Allocator>>,
        options: Option<PoolOptions>,
    ) -> Result<Self, PoolError> {
        let (allocator, options) = self.with_node(|parent| {
            (
                allocator.unwrap_or_else(|| Arc::clone(&parent.allocator)),
                options.unwrap_or_else(|| parent.options.clone()),
            )
        })?;
        let node = PoolNode::new(Some(self.id), allocator, false, options.normalize())?;
        let id = {
            let mut tree = self.borrow_mut()?;
            tree.node_mut(self.id)?;
            let id = tree.insert(node);
            tree.node_mut(self.id)?.children.push(id);
            id
        };
        runtime::record_pool_created();
        Ok(Self {
            tree: Rc::clone(&self.tree),
            id,
        })
    }

    fn borrow(&self) -> Result<Ref<'_, PoolTree>, PoolError> {
        self.tree.try_borrow().map_err(|_| PoolError::Busy)
    }

    fn borrow_mut(&self) -> Result<RefMut<'_, PoolTree>, PoolError> {
        self.tree.try_borrow_mut().map_err(|_| PoolError::Busy)
    }

    fn with_node<R>(&self, f: impl FnOnce(&PoolNode) -> R) -> Result<R, PoolError> {
        let tree = self.borrow()?;
        Ok(f(tree.node(self.id)?))
    }

    fn with_node_mut<R>(&self, f: impl FnOnce(&mut PoolNode) -> R) -> Result<R, PoolError> {
        let mut tree = self.borrow_mut()?;
        Ok(f(tree.node_mut(self.id)?))
    }

    fn sibling(&self, id: PoolId) -> Self {
        Self {
            tree: Rc::clone(&self.tree),
            id,
        }
    }

    /// Arena id of this pool.
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Whether the pool has not been destroyed.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.tree
            .try_borrow()
            .is_ok_and(|tree| tree.node(self.id).is_ok())
    }

    /// Live pools in this pool's tree.
    pub fn tree_size(&self) -> Result<usize, PoolError> {
        Ok(self.borrow()?.live())
    }

    // ---- allocation ----

    /// Allocate `size` bytes at the pool's default alignment.
    pub fn palloc(&self, size: usize) -> Result<Allocation, PoolError> {
        let align = self.with_node(|n| n.options.default_align)?;
        self.palloc_aligned(size, align)
    }

    /// Allocate `size` bytes aligned to `align`.
    pub fn palloc_aligned(&self, size: usize, align: usize) -> Result<Allocation, PoolError> {
        if !align.is_power_of_two() {
            return Err(PoolError::InvalidAlignment(align));
        }
        let mut tree = self.borrow_mut()?;
        let node = tree.node_mut(self.id)?;
        let (block, offset) = if size >= node.options.large_threshold {
            node.large.alloc(&node.allocator, size, align)?
        } else {
            node.bump(size, align)?
        };
        node.bytes_handed += size;
        let addr = node
            .find_block(block)
            .map_or(0, |b| b.base_addr() + offset);
        Ok(Allocation {
            block,
            offset,
            len: size,
            addr,
        })
    }

    /// Allocate `size` zero-filled bytes.
    pub fn calloc(&self, size: usize) -> Result<Allocation, PoolError> {
        let alloc = self.palloc(size)?;
        self.bytes_mut(&alloc)?.fill(0);
        Ok(alloc)
    }

    /// Copy `data` into the pool.
    pub fn memdup(&self, data: &[u8]) -> Result<Allocation, PoolError> {
        let alloc = self.palloc_aligned(data.len(), 1)?;
        self.bytes_mut(&alloc)?.copy_from_slice(data);
        Ok(alloc)
    }

    /// Copy a string into the pool.
    pub fn strdup(&self, s: &str) -> Result<Allocation, PoolError> {
        self.memdup(s.as_bytes())
    }

    /// Read an allocation back as a string.
    pub fn read_str(&self, alloc: &Allocation) -> Result<String, PoolError> {
        let bytes = self.bytes(alloc)?.to_vec();
        Ok(String::from_utf8(bytes)?)
    }

    /// Borrow the bytes of an allocation.
    ///
    /// The guard borrows the whole tree; other pool calls fail with
    /// [`PoolError::Busy`] while it is alive.
    pub fn bytes(&self, alloc: &Allocation) -> Result<Ref<'_, [u8]>, PoolError> {
        let tree = self.borrow()?;
        tree.node(self.id)?;
        Ref::filter_map(tree, |t| {
            t.node(self.id)
                .ok()
                .and_then(|n| n.find_block(alloc.block))
                .and_then(|b| b.slice(alloc.offset, alloc.len))
        })
        .map_err(|_| PoolError::StaleAllocation)
    }

    /// Mutably borrow the bytes of an allocation.
    pub fn bytes_mut(&self, alloc: &Allocation) -> Result<RefMut<'_, [u8]>, PoolError> {
        let mut tree = self.borrow_mut()?;
        tree.node_mut(self.id)?;
        RefMut::filter_map(tree, |t| {
            t.node_mut(self.id)
                .ok()
                .and_then(|n| n.find_block_mut(alloc.block))
                .and_then(|b| b.slice_mut(alloc.offset, alloc.len))
        })
        .map_err(|_| PoolError::StaleAllocation)
    }

    /// Copy `data` into an allocation at `offset`.
    pub fn write(&self, alloc: &Allocation, offset: usize, data: &[u8]) -> Result<(), PoolError> {
        let end = offset.checked_add(data.len());
        if end.map_or(true, |end| end > alloc.len) {
            return Err(PoolError::OutOfBounds {
                offset,
                len: data.len(),
                size: alloc.len,
            });
        }
        self.bytes_mut(alloc)?[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Hint that an allocation is no longer needed.
    ///
    /// Small allocations stay where they are until the next clear. Large
    /// ones go back to the pool's reuse list; returns whether that happened.
    pub fn free(&self, alloc: &Allocation, size: usize) -> Result<bool, PoolError> {
        let mut tree = self.borrow_mut()?;
        let node = tree.node_mut(self.id)?;
        if size < node.options.large_threshold {
            return Ok(false);
        }
        let released = node.large.release(&node.allocator, alloc.block);
        if !released {
            warn!(size, "free of unknown large allocation");
        }
        Ok(released)
    }

    // ---- typed values ----

    /// Move a value into the pool. It is dropped when the pool is cleared.
    pub fn emplace<T: 'static>(&self, value: T) -> Result<PoolValue<T>, PoolError> {
        let (epoch, slot) = self.adopt(Box::new(Rc::new(value)))?;
        Ok(PoolValue {
            pool: self.id,
            epoch,
            slot,
            _marker: PhantomData,
        })
    }

    /// Shared reference to a value placed with [`Pool::emplace`].
    pub fn value<T: 'static>(&self, handle: &PoolValue<T>) -> Result<Rc<T>, PoolError> {
        if handle.pool != self.id {
            return Err(PoolError::StaleValue);
        }
        let tree = self.borrow()?;
        let node = tree.node(self.id)?;
        if node.epoch != handle.epoch {
            return Err(PoolError::StaleValue);
        }
        node.values
            .get(handle.slot)
            .and_then(Option::as_ref)
            .and_then(|v| v.downcast_ref::<Rc<T>>())
            .cloned()
            .ok_or(PoolError::StaleValue)
    }

    /// Keep an arbitrary value alive until the next clear.
    pub(crate) fn adopt(&self, value: Box<dyn Any>) -> Result<(u64, usize), PoolError> {
        self.with_node_mut(|node| (node.epoch, node.adopt(value)))
    }

    /// Like [`Pool::adopt`], also returning the queue through which the
    /// slot is handed back once its owner lets go of it.
    pub(crate) fn adopt_releasable(
        &self,
        value: Box<dyn Any>,
    ) -> Result<(u64, usize, ReleaseQueue), PoolError> {
        self.with_node_mut(|node| {
            let slot = node.adopt(value);
            (node.epoch, slot, Arc::clone(&node.released))
        })
    }

    // ---- cleanups ----

    /// Register a cleanup to run when the pool is cleared or destroyed.
    pub fn cleanup_register(&self, f: impl FnOnce() + 'static) -> Result<CleanupId, PoolError> {
        self.push_cleanup(ChainKind::Ordinary, CleanupEntry::closure(Box::new(f)))
    }

    /// Register a cleanup that runs before every ordinary cleanup.
    pub fn pre_cleanup_register(
        &self,
        f: impl FnOnce() + 'static,
    ) -> Result<CleanupId, PoolError> {
        self.push_cleanup(ChainKind::Pre, CleanupEntry::closure(Box::new(f)))
    }

    /// Register `cb(data)` as a cleanup, killable by the same pair.
    pub fn cleanup_register_raw(&self, data: usize, cb: RawCleanup) -> Result<CleanupId, PoolError> {
        self.push_cleanup(ChainKind::Ordinary, CleanupEntry::raw(data, cb))
    }

    /// Register `cb(data)` as a pre-cleanup, killable by the same pair.
    pub fn pre_cleanup_register_raw(
        &self,
        data: usize,
        cb: RawCleanup,
    ) -> Result<CleanupId, PoolError> {
        self.push_cleanup(ChainKind::Pre, CleanupEntry::raw(data, cb))
    }

    fn push_cleanup(&self, kind: ChainKind, entry: CleanupEntry) -> Result<CleanupId, PoolError> {
        self.with_node_mut(|node| node.chain_mut(kind).push(entry))
    }

    /// Unregister a cleanup without running it.
    pub fn cleanup_kill(&self, id: CleanupId) -> Result<bool, PoolError> {
        self.with_node_mut(|node| {
            node.pre_cleanups.take(id).is_some() || node.cleanups.take(id).is_some()
        })
    }

    /// Unregister every raw cleanup matching `(data, cb)` on either chain.
    pub fn cleanup_kill_raw(&self, data: usize, cb: RawCleanup) -> Result<usize, PoolError> {
        self.with_node_mut(|node| {
            node.pre_cleanups.kill_raw(data, cb) + node.cleanups.kill_raw(data, cb)
        })
    }

    /// Unregister a cleanup and run it now.
    pub fn cleanup_run(&self, id: CleanupId) -> Result<bool, PoolError> {
        let entry = self.with_node_mut(|node| {
            node.pre_cleanups
                .take(id)
                .or_else(|| node.cleanups.take(id))
        })?;
        Ok(entry.map(CleanupEntry::run).is_some())
    }

    // ---- userdata ----

    /// Attach a value under a copy of `key`. The optional cleanup receives
    /// the value when the pool is cleared.
    pub fn userdata_set(
        &self,
        key: &str,
        value: UserValue,
        cleanup: Option<UserdataCleanup>,
    ) -> Result<(), PoolError> {
        self.with_node_mut(|node| {
            let table = node.userdata.get_or_insert_with(Default::default);
            table.set(key, Rc::clone(&value));
            if let Some(cb) = cleanup {
                node.cleanups
                    .push(CleanupEntry::closure(Box::new(move || cb(value))));
            }
        })
    }

    /// Attach a value under a key that is not copied.
    pub fn userdata_setn(
        &self,
        key: &'static str,
        value: UserValue,
        cleanup: Option<UserdataCleanup>,
    ) -> Result<(), PoolError> {
        self.with_node_mut(|node| {
            let table = node.userdata.get_or_insert_with(Default::default);
            table.setn(key, Rc::clone(&value));
            if let Some(cb) = cleanup {
                node.cleanups
                    .push(CleanupEntry::closure(Box::new(move || cb(value))));
            }
        })
    }

    /// Look up a userdata value.
    pub fn userdata_get(&self, key: &str) -> Result<Option<UserValue>, PoolError> {
        self.with_node(|node| node.userdata.as_ref().and_then(|t| t.get(key)))
    }

    /// Look up a userdata value of a known type.
    pub fn userdata_get_as<T: 'static>(&self, key: &str) -> Result<Option<Rc<T>>, PoolError> {
        Ok(self
            .userdata_get(key)?
            .and_then(|value| value.downcast::<T>().ok()))
    }

    // ---- lifecycle ----

    /// Run every cleanup, destroy every child and release all memory except
    /// the self block. The pool stays usable.
    pub fn clear(&self) -> Result<(), PoolError> {
        self.borrow_mut()?.node(self.id)?;
        clear_node(&self.tree, self.id)
    }

    /// Clear the pool, detach it from its parent and release its self block.
    /// Every handle to it becomes stale.
    pub fn destroy(&self) -> Result<(), PoolError> {
        self.borrow_mut()?.node(self.id)?;
        destroy_node(&self.tree, self.id)
    }

    // ---- introspection ----

    /// Parent pool, if this pool is managed.
    pub fn parent(&self) -> Result<Option<Self>, PoolError> {
        let parent = self.with_node(|n| n.parent)?;
        Ok(parent.map(|id| self.sibling(id)))
    }

    /// Direct children, most recent last.
    pub fn children(&self) -> Result<Vec<Self>, PoolError> {
        let ids = self.with_node(|n| n.children.clone())?;
        Ok(ids.into_iter().map(|id| self.sibling(id)).collect())
    }

    /// Whether `self` is `other` or one of its ancestors.
    pub fn is_ancestor(&self, other: &Self) -> Result<bool, PoolError> {
        if !Rc::ptr_eq(&self.tree, &other.tree) {
            return Ok(false);
        }
        let tree = self.borrow()?;
        let mut cursor = Some(other.id);
        while let Some(id) = cursor {
            if id == self.id {
                return Ok(true);
            }
            cursor = tree.node(id)?.parent;
        }
        Ok(false)
    }

    /// Allocator this pool draws from.
    pub fn allocator(&self) -> Result<Arc<Allocator>, PoolError> {
        self.with_node(|n| Arc::clone(&n.allocator))
    }

    /// Whether this pool created its allocator.
    pub fn owns_allocator(&self) -> Result<bool, PoolError> {
        self.with_node(|n| n.owns_allocator)
    }

    /// Options in effect.
    pub fn options(&self) -> Result<PoolOptions, PoolError> {
        self.with_node(|n| n.options.clone())
    }

    /// Bytes requested since the last clear, optionally including children.
    pub fn num_bytes(&self, recurse: bool) -> Result<usize, PoolError> {
        fn walk(tree: &PoolTree, id: PoolId, recurse: bool) -> Result<usize, PoolError> {
            let node = tree.node(id)?;
            let mut total = node.bytes_handed;
            if recurse {
                for &child in &node.children {
                    total += walk(tree, child, true)?;
                }
            }
            Ok(total)
        }
        walk(&*self.borrow()?, self.id, recurse)
    }

    /// Bookkeeping snapshot.
    pub fn stats(&self) -> Result<PoolStats, PoolError> {
        self.with_node_mut(|n| {
            n.reap_released();
            PoolStats {
                blocks: n.blocks.len(),
                capacity: n.blocks.iter().map(|b| b.size()).sum(),
                used: n.blocks.iter().map(|b| b.used()).sum(),
                bytes_handed: n.bytes_handed,
                children: n.children.len(),
                pre_cleanups: n.pre_cleanups.len(),
                cleanups: n.cleanups.len(),
                userdata_keys: n.userdata.as_ref().map_or(0, |t| t.len()),
                values: n.live_values(),
                large: n.large.stats(),
            }
        })
    }

    /// Debug tag.
    pub fn tag(&self) -> Result<Option<String>, PoolError> {
        self.with_node(|n| n.tag.clone())
    }

    /// Set the debug tag.
    pub fn set_tag(&self, tag: &str) -> Result<(), PoolError> {
        self.with_node_mut(|n| n.tag = Some(tag.to_owned()))
    }

    /// Creation site, if recorded.
    pub fn info(&self) -> Result<Option<PoolInfo>, PoolError> {
        self.with_node(|n| n.info)
    }

    /// Record the creation site.
    pub fn set_info(&self, info: PoolInfo) -> Result<(), PoolError> {
        self.with_node_mut(|n| n.info = Some(info))
    }

    /// Indented rendering of this pool and its descendants.
    pub fn describe(&self) -> Result<String, PoolError> {
        fn render(tree: &PoolTree, id: PoolId, depth: usize, out: &mut String) -> Result<(), PoolError> {
            let node = tree.node(id)?;
            let _ = write!(
                out,
                "{:indent$}pool#{}.{} blocks={} bytes={}",
                "",
                id.index(),
                id.generation(),
                node.blocks.len(),
                node.bytes_handed,
                indent = depth * 2
            );
            if let Some(tag) = &node.tag {
                let _ = write!(out, " tag={tag}");
            }
            if let Some(info) = &node.info {
                let _ = write!(out, " at={info}");
            }
            if let Some(table) = &node.userdata {
                let mut keys: Vec<_> = table.keys().collect();
                keys.sort_unstable();
                let _ = write!(out, " userdata=[{}]", keys.join(","));
            }
            out.push('\n');
            for &child in &node.children {
                render(tree, child, depth + 1, out)?;
            }
            Ok(())
        }
        let mut out = String::new();
        render(&*self.borrow()?, self.id, 0, &mut out)?;
        Ok(out)
    }
}

impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.tree, &other.tree) && self.id == other.id
    }
}

impl Eq for Pool {}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("index", &self.id.index())
            .field("generation", &self.id.generation())
            .field("alive", &self.is_alive())
            .finish()
    }
}
