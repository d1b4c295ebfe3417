//! Arena of pool nodes and the teardown algorithm.
//!
//! A root pool owns one [`PoolTree`]; every managed descendant lives in the
//! same arena and refers to its parent and children by [`PoolId`]. Slots are
//! generation-checked so handles to destroyed pools are detected.
//!
//! The tree is borrowed only for bookkeeping. Every user callback, drop of a
//! typed value and drop of userdata happens with the borrow released, so
//! callbacks may freely call back into the pool API.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;
use poolkit_alloc::{Allocator, Block, BlockId};
use tracing::{debug, trace, warn};

use super::cleanup::{ChainKind, CleanupChain};
use super::large::LargeBlockCache;
use super::userdata::UserdataTable;
use super::PoolInfo;
use crate::error::PoolError;
use crate::options::PoolOptions;
use crate::runtime;

pub(crate) type SharedTree = Rc<RefCell<PoolTree>>;

/// Value slots vacated from outside the pool, as `(epoch, slot)`. Shared
/// with pool-owned `Rc`s, which may be released on any thread.
pub(crate) type ReleaseQueue = Arc<Mutex<Vec<(u64, usize)>>>;

/// Generation-checked index of a pool inside its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId {
    index: u32,
    generation: u32,
}

impl PoolId {
    /// Slot index inside the owning tree.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot at creation time.
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

pub(crate) struct PoolNode {
    pub(crate) parent: Option<PoolId>,
    pub(crate) children: Vec<PoolId>,
    pub(crate) allocator: Arc<Allocator>,
    pub(crate) owns_allocator: bool,
    pub(crate) options: PoolOptions,
    /// `blocks[0]` is the self block; the last block is the active one.
    pub(crate) blocks: Vec<Block>,
    pub(crate) pre_cleanups: CleanupChain,
    pub(crate) cleanups: CleanupChain,
    pub(crate) userdata: Option<UserdataTable>,
    pub(crate) large: LargeBlockCache,
    pub(crate) values: Vec<Option<Box<dyn Any>>>,
    free_slots: Vec<usize>,
    pub(crate) released: ReleaseQueue,
    /// Bumped by every clear; typed values from older epochs are stale.
    pub(crate) epoch: u64,
    pub(crate) bytes_handed: usize,
    pub(crate) tag: Option<String>,
    pub(crate) info: Option<PoolInfo>,
}

impl PoolNode {
    pub(crate) fn new(
        parent: Option<PoolId>,
        allocator: Arc<Allocator>,
        owns_allocator: bool,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        let self_block = allocator.alloc(options.initial_block_size)?;
        Ok(Self {
            parent,
            children: Vec::new(),
            owns_allocator,
            large: LargeBlockCache::new(options.large_cache_max_bytes),
            options,
            blocks: vec![self_block],
            pre_cleanups: CleanupChain::default(),
            cleanups: CleanupChain::default(),
            userdata: None,
            values: Vec::new(),
            free_slots: Vec::new(),
            released: ReleaseQueue::default(),
            epoch: 0,
            bytes_handed: 0,
            tag: None,
            info: None,
            allocator,
        })
    }

    pub(crate) fn chain_mut(&mut self, kind: ChainKind) -> &mut CleanupChain {
        match kind {
            ChainKind::Pre => &mut self.pre_cleanups,
            ChainKind::Ordinary => &mut self.cleanups,
        }
    }

    /// Store a value until the next clear, reusing vacated slots.
    pub(crate) fn adopt(&mut self, value: Box<dyn Any>) -> usize {
        self.reap_released();
        match self.free_slots.pop() {
            Some(slot) => {
                self.values[slot] = Some(value);
                slot
            }
            None => {
                self.values.push(Some(value));
                self.values.len() - 1
            }
        }
    }

    /// Free the slots of pool-owned objects released since the last call.
    pub(crate) fn reap_released(&mut self) {
        let vacated = std::mem::take(&mut *self.released.lock());
        for (epoch, slot) in vacated {
            if epoch != self.epoch {
                continue;
            }
            if let Some(entry) = self.values.get_mut(slot) {
                if entry.take().is_some() {
                    self.free_slots.push(slot);
                }
            }
        }
    }

    pub(crate) fn live_values(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Bump-allocate from the block chain, growing it if needed.
    pub(crate) fn bump(&mut self, size: usize, align: usize) -> Result<(BlockId, usize), PoolError> {
        if let Some(active) = self.blocks.last_mut() {
            if let Some(offset) = active.bump(size, align) {
                return Ok((active.id(), offset));
            }
        }

        let last = self.blocks.last().map_or(0, Block::size);
        let needed = size
            .checked_add(align - 1)
            .ok_or(PoolError::OutOfMemory { size })?;
        let grown = last.saturating_mul(2).min(self.options.max_block_size);
        let mut block = self.allocator.alloc(needed.max(grown))?;
        let offset = block
            .bump(size, align)
            .ok_or(PoolError::OutOfMemory { size })?;
        let id = block.id();
        trace!(size = block.size(), chain = self.blocks.len() + 1, "pool chain grew");
        self.blocks.push(block);
        Ok((id, offset))
    }

    pub(crate) fn find_block(&self, id: BlockId) -> Option<&Block> {
        self.blocks
            .iter()
            .find(|b| b.id() == id)
            .or_else(|| self.large.find(id))
    }

    pub(crate) fn find_block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        match self.blocks.iter().position(|b| b.id() == id) {
            Some(pos) => self.blocks.get_mut(pos),
            None => self.large.find_mut(id),
        }
    }

    fn has_pending_cleanups(&self) -> bool {
        !self.pre_cleanups.is_empty() || !self.cleanups.is_empty()
    }
}

struct Slot {
    generation: u32,
    node: Option<PoolNode>,
}

/// Slot arena holding one root pool and all of its managed descendants.
pub(crate) struct PoolTree {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
}

impl PoolTree {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, node: PoolNode) -> PoolId {
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return PoolId {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        PoolId {
            index,
            generation: 0,
        }
    }

    pub(crate) fn node(&self, id: PoolId) -> Result<&PoolNode, PoolError> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
            .ok_or(PoolError::StalePool)
    }

    pub(crate) fn node_mut(&mut self, id: PoolId) -> Result<&mut PoolNode, PoolError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
            .ok_or(PoolError::StalePool)
    }

    /// Take a node out of its slot; the slot's generation moves on.
    fn remove(&mut self, id: PoolId) -> Result<PoolNode, PoolError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .ok_or(PoolError::StalePool)?;
        let node = slot.node.take().ok_or(PoolError::StalePool)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        Ok(node)
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }
}

impl Drop for PoolTree {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            let Some(mut node) = slot.node.take() else {
                continue;
            };
            if node.has_pending_cleanups() {
                warn!(
                    pre = node.pre_cleanups.len(),
                    ordinary = node.cleanups.len(),
                    "pool dropped without destroy; cleanups not run"
                );
            }
            let mut blocks = node.large.reset();
            blocks.append(&mut node.blocks);
            node.allocator.free_many(blocks);
            runtime::record_pool_destroyed();
        }
    }
}

fn drain_chain(tree: &SharedTree, id: PoolId, kind: ChainKind) -> Result<(), PoolError> {
    loop {
        let entry = tree.borrow_mut().node_mut(id)?.chain_mut(kind).pop();
        match entry {
            Some(entry) => entry.run(),
            None => return Ok(()),
        }
    }
}

/// Run the chains of `id` and then of every descendant, touching no storage.
fn drain_subtree(tree: &SharedTree, id: PoolId) -> Result<(), PoolError> {
    drain_chain(tree, id, ChainKind::Pre)?;
    drain_chain(tree, id, ChainKind::Ordinary)?;
    let children = tree.borrow().node(id)?.children.clone();
    for child in children.into_iter().rev() {
        match drain_subtree(tree, child) {
            Ok(()) | Err(PoolError::StalePool) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Reset a pool to empty.
///
/// All cleanups of the pool and its descendants run before any storage in
/// the subtree is released. Children are then destroyed, typed values and
/// userdata dropped, and every block except the self block handed back.
pub(crate) fn clear_node(tree: &SharedTree, id: PoolId) -> Result<(), PoolError> {
    loop {
        drain_subtree(tree, id)?;
        loop {
            let next = tree.borrow().node(id)?.children.last().copied();
            let Some(child) = next else { break };
            if destroy_node(tree, child).is_err() {
                tree.borrow_mut().node_mut(id)?.children.retain(|&c| c != child);
            }
        }
        let tree_ref = tree.borrow();
        let node = tree_ref.node(id)?;
        if !node.has_pending_cleanups() && node.children.is_empty() {
            break;
        }
    }

    let (mut values, userdata, returned, allocator) = {
        let mut tree_mut = tree.borrow_mut();
        let node = tree_mut.node_mut(id)?;
        node.epoch += 1;
        node.bytes_handed = 0;
        let values = std::mem::take(&mut node.values);
        node.free_slots.clear();
        node.released.lock().clear();
        let userdata = node.userdata.take();
        let mut returned = node.large.reset();
        returned.extend(node.blocks.drain(1..));
        if let Some(self_block) = node.blocks.first_mut() {
            self_block.renew();
        }
        (values, userdata, returned, Arc::clone(&node.allocator))
    };

    while let Some(value) = values.pop() {
        drop(value);
    }
    drop(userdata);
    if !returned.is_empty() {
        trace!(blocks = returned.len(), "pool cleared");
        allocator.free_many(returned);
    }
    Ok(())
}

/// Clear a pool, unlink it from its parent and release its self block.
pub(crate) fn destroy_node(tree: &SharedTree, id: PoolId) -> Result<(), PoolError> {
    clear_node(tree, id)?;
    let node = {
        let mut tree_mut = tree.borrow_mut();
        let node = tree_mut.remove(id)?;
        if let Some(parent) = node.parent {
            if let Ok(parent) = tree_mut.node_mut(parent) {
                parent.children.retain(|&c| c != id);
            }
        }
        node
    };

    let PoolNode {
        allocator,
        blocks,
        owns_allocator,
        ..
    } = node;
    allocator.free_many(blocks);
    runtime::record_pool_destroyed();
    debug!(index = id.index, owns_allocator, "pool destroyed");
    Ok(())
}
