//! LIFO cleanup chains.
//!
//! Every pool carries two chains: pre-cleanups, which run before anything
//! else on clear or destroy, and ordinary cleanups, which run after them.
//! Entries are popped one at a time so that the tree borrow can be released
//! around each callback.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CLEANUP_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one cleanup registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CleanupId(u64);

impl CleanupId {
    fn next() -> Self {
        Self(NEXT_CLEANUP_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Plain-function callback over an opaque word, the shape that crosses the
/// foreign boundary.
pub type RawCleanup = fn(usize);

/// Which chain a registration lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// Runs first on clear/destroy.
    Pre,
    /// Runs after every pre-cleanup.
    Ordinary,
}

pub(crate) struct CleanupEntry {
    id: CleanupId,
    raw: Option<(usize, usize)>,
    run: Box<dyn FnOnce()>,
}

impl CleanupEntry {
    pub(crate) fn closure(run: Box<dyn FnOnce()>) -> Self {
        Self {
            id: CleanupId::next(),
            raw: None,
            run,
        }
    }

    pub(crate) fn raw(data: usize, cb: RawCleanup) -> Self {
        Self {
            id: CleanupId::next(),
            raw: Some((data, cb as usize)),
            run: Box::new(move || cb(data)),
        }
    }

    pub(crate) fn id(&self) -> CleanupId {
        self.id
    }

    pub(crate) fn run(self) {
        (self.run)();
    }
}

#[derive(Default)]
pub(crate) struct CleanupChain {
    entries: Vec<CleanupEntry>,
}

impl CleanupChain {
    pub(crate) fn push(&mut self, entry: CleanupEntry) -> CleanupId {
        let id = entry.id();
        self.entries.push(entry);
        id
    }

    /// Most recently registered entry.
    pub(crate) fn pop(&mut self) -> Option<CleanupEntry> {
        self.entries.pop()
    }

    pub(crate) fn take(&mut self, id: CleanupId) -> Option<CleanupEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Remove every raw registration matching `(data, cb)`.
    pub(crate) fn kill_raw(&mut self, data: usize, cb: RawCleanup) -> usize {
        let key = Some((data, cb as usize));
        let before = self.entries.len();
        self.entries.retain(|e| e.raw != key);
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
