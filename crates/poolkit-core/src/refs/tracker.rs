//! Retain/release pairing for leak hunting.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use super::RetainId;

struct RetainRecord {
    count: u32,
    thread: Option<String>,
    backtrace: Option<Backtrace>,
}

/// Records each live retain by `(object, id)`.
///
/// A release whose id was never recorded is logged and counted as a
/// mismatch; it never affects the reference count itself.
pub struct RetainTracker {
    capture_backtraces: bool,
    live: Mutex<HashMap<(usize, RetainId), RetainRecord>>,
    mismatches: AtomicU64,
}

impl RetainTracker {
    /// Create a tracker, optionally capturing a backtrace per retain.
    #[must_use]
    pub fn new(capture_backtraces: bool) -> Self {
        Self {
            capture_backtraces,
            live: Mutex::new(HashMap::new()),
            mismatches: AtomicU64::new(0),
        }
    }

    /// Record a retain of `object`; allocates an id for [`RetainId::NEW`].
    pub fn record(&self, object: usize, id: RetainId, count: u32) -> RetainId {
        let id = if id.is_new() { RetainId::fresh() } else { id };
        let record = RetainRecord {
            count,
            thread: std::thread::current().name().map(str::to_owned),
            backtrace: self.capture_backtraces.then(Backtrace::force_capture),
        };
        if self.live.lock().insert((object, id), record).is_some() {
            warn!(object, id = id.get(), "retain id recorded twice");
        }
        id
    }

    /// Forget a retain. Returns false, and logs, if it was never recorded.
    pub fn forget(&self, object: usize, id: RetainId) -> bool {
        let removed = self.live.lock().remove(&(object, id)).is_some();
        if !removed {
            self.mismatches.fetch_add(1, Ordering::Relaxed);
            warn!(object, id = id.get(), "release without a matching retain");
        }
        removed
    }

    /// Retains not yet released.
    pub fn outstanding(&self) -> usize {
        self.live.lock().len()
    }

    /// Retains of one object not yet released.
    pub fn outstanding_for(&self, object: usize) -> usize {
        self.live.lock().keys().filter(|(o, _)| *o == object).count()
    }

    /// Releases that matched no retain.
    pub fn mismatches(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }

    /// Listing of every outstanding retain, ordered by id.
    pub fn report(&self) -> String {
        let live = self.live.lock();
        let mut entries: Vec<_> = live.iter().collect();
        entries.sort_by_key(|((_, id), _)| *id);
        let mut out = String::new();
        for ((object, id), record) in entries {
            let _ = writeln!(
                out,
                "retain #{} of {object:#x} (count {}) on {}",
                id.get(),
                record.count,
                record.thread.as_deref().unwrap_or("<unnamed>")
            );
            if let Some(bt) = &record.backtrace {
                let _ = writeln!(out, "{bt}");
            }
        }
        out
    }
}

impl std::fmt::Debug for RetainTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetainTracker")
            .field("capture_backtraces", &self.capture_backtraces)
            .field("outstanding", &self.outstanding())
            .field("mismatches", &self.mismatches())
            .finish()
    }
}
