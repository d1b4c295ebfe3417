//! Raw memory blocks with a bump cursor.
//!
//! A [`Block`] is one contiguous, system-backed byte range. It is owned by
//! exactly one allocator bucket or one pool chain at a time. Storage is a
//! boxed slice, so the base address never moves while the owning vectors grow.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AllocError;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one tenancy of a block.
///
/// A block gets a fresh id every time it is handed out or reset, so
/// allocations made against an earlier tenancy can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    fn next() -> Self {
        Self(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// One contiguous range of bytes with a bump cursor.
pub struct Block {
    id: BlockId,
    index: usize,
    data: Box<[u8]>,
    cursor: usize,
}

impl Block {
    /// Map a fresh zero-filled block of exactly `size` bytes.
    pub(crate) fn map(size: usize, index: usize) -> Result<Self, AllocError> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| AllocError::OutOfMemory { size })?;
        data.resize(size, 0);
        Ok(Self {
            id: BlockId::next(),
            index,
            data: data.into_boxed_slice(),
            cursor: 0,
        })
    }

    /// Start a new tenancy: fresh id, empty cursor. Contents are not cleared.
    pub fn renew(&mut self) {
        self.id = BlockId::next();
        self.cursor = 0;
    }

    /// Current tenancy id.
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Size-class bucket this block returns to (0 = sink).
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Bytes already handed out.
    #[must_use]
    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Bytes still available past the cursor (ignoring alignment).
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Address of the first byte.
    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// Bump-allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// Alignment is applied to the real address, not the offset. Returns the
    /// offset of the range, or `None` if the block cannot fit it.
    pub fn bump(&mut self, size: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        let base = self.base_addr();
        let start = align_up(base.checked_add(self.cursor)?, align)?;
        let offset = start - base;
        let end = offset.checked_add(size)?;
        if end > self.data.len() {
            return None;
        }
        self.cursor = end;
        Some(offset)
    }

    /// Bytes `offset..offset + len`, if in range.
    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.data.get(offset..offset.checked_add(len)?)
    }

    /// Mutable bytes `offset..offset + len`, if in range.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        self.data.get_mut(offset..offset.checked_add(len)?)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("size", &self.data.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// Round `addr` up to a multiple of `align`.
#[inline]
#[must_use]
pub fn align_up(addr: usize, align: usize) -> Option<usize> {
    let mask = align - 1;
    addr.checked_add(mask).map(|v| v & !mask)
}
