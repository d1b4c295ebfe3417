//! Process-wide runtime state.
//!
//! The runtime owns the optional retain tracker and a handful of lifetime
//! counters. It is brought up with [`init`] and torn down with
//! [`terminate`]; pools work without it, but reference tracking only
//! happens while it is running with tracking enabled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::RuntimeError;
use crate::refs::RetainTracker;

/// Environment variable enabling retain tracking.
pub const ENV_TRACK_REFS: &str = "POOLKIT_TRACK_REFS";

/// Environment variable enabling backtrace capture for tracked retains.
pub const ENV_BACKTRACE: &str = "POOLKIT_BACKTRACE";

/// Runtime settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    /// Record every retain/release pair.
    pub track_refs: bool,
    /// Capture a backtrace with every tracked retain.
    pub capture_backtraces: bool,
}

impl RuntimeConfig {
    /// Read settings from `POOLKIT_TRACK_REFS` and `POOLKIT_BACKTRACE`.
    #[must_use]
    pub fn from_env() -> Self {
        let track_refs = parse_flag(std::env::var(ENV_TRACK_REFS).ok().as_deref());
        let capture_backtraces = parse_flag(std::env::var(ENV_BACKTRACE).ok().as_deref());
        Self {
            track_refs: track_refs || capture_backtraces,
            capture_backtraces,
        }
    }
}

fn parse_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

enum RuntimeState {
    Uninitialized,
    Running {
        config: RuntimeConfig,
        tracker: Option<Arc<RetainTracker>>,
    },
    Terminated,
}

static STATE: RwLock<RuntimeState> = parking_lot::const_rwlock(RuntimeState::Uninitialized);

static POOLS_CREATED: AtomicUsize = AtomicUsize::new(0);
static POOLS_DESTROYED: AtomicUsize = AtomicUsize::new(0);
static SHARED_LIVE: AtomicUsize = AtomicUsize::new(0);

/// Bring the runtime up.
pub fn init(config: RuntimeConfig) -> Result<(), RuntimeError> {
    let mut state = STATE.write();
    if matches!(*state, RuntimeState::Running { .. }) {
        return Err(RuntimeError::AlreadyInitialized);
    }
    let tracker = config
        .track_refs
        .then(|| Arc::new(RetainTracker::new(config.capture_backtraces)));
    *state = RuntimeState::Running { config, tracker };
    info!(
        track_refs = config.track_refs,
        capture_backtraces = config.capture_backtraces,
        "poolkit runtime initialized"
    );
    Ok(())
}

/// Outcome of [`terminate`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct TerminationReport {
    /// Tracked retains never released.
    pub outstanding_retains: usize,
    /// Pools created but never destroyed.
    pub live_pools: usize,
    /// Shared handles never released.
    pub live_shared_handles: usize,
    /// Human-readable dump of outstanding retains.
    pub details: String,
}

impl TerminationReport {
    /// Whether nothing leaked.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.outstanding_retains == 0 && self.live_pools == 0 && self.live_shared_handles == 0
    }
}

/// Tear the runtime down, reporting anything still alive.
pub fn terminate() -> Result<TerminationReport, RuntimeError> {
    let tracker = {
        let mut state = STATE.write();
        match std::mem::replace(&mut *state, RuntimeState::Terminated) {
            RuntimeState::Running { tracker, .. } => tracker,
            other => {
                *state = other;
                return Err(RuntimeError::NotInitialized);
            }
        }
    };

    let diag = diagnostics();
    let mut report = TerminationReport {
        live_pools: diag.live_pools,
        live_shared_handles: diag.live_shared_handles,
        ..TerminationReport::default()
    };
    if let Some(tracker) = tracker {
        report.outstanding_retains = tracker.outstanding();
        report.details = tracker.report();
    }
    if report.outstanding_retains > 0 {
        warn!(
            outstanding = report.outstanding_retains,
            "unreleased references at terminate\n{}", report.details
        );
    }
    if report.live_shared_handles > 0 {
        warn!(live = report.live_shared_handles, "shared handles alive at terminate");
    }
    info!(live_pools = report.live_pools, "poolkit runtime terminated");
    Ok(report)
}

/// Whether [`init`] has run without a matching [`terminate`].
#[must_use]
pub fn is_initialized() -> bool {
    matches!(*STATE.read(), RuntimeState::Running { .. })
}

/// Settings in effect, if running.
#[must_use]
pub fn config() -> Option<RuntimeConfig> {
    match &*STATE.read() {
        RuntimeState::Running { config, .. } => Some(*config),
        _ => None,
    }
}

/// Global retain tracker, if tracking is on.
#[must_use]
pub fn tracker() -> Option<Arc<RetainTracker>> {
    match &*STATE.read() {
        RuntimeState::Running { tracker, .. } => tracker.clone(),
        _ => None,
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Pools created since process start.
    pub pools_created: usize,
    /// Pools destroyed since process start.
    pub pools_destroyed: usize,
    /// Pools currently alive.
    pub live_pools: usize,
    /// Shared handles currently alive.
    pub live_shared_handles: usize,
}

/// Snapshot of the lifetime counters.
#[must_use]
pub fn diagnostics() -> Diagnostics {
    let created = POOLS_CREATED.load(Ordering::Relaxed);
    let destroyed = POOLS_DESTROYED.load(Ordering::Relaxed);
    Diagnostics {
        pools_created: created,
        pools_destroyed: destroyed,
        live_pools: created.saturating_sub(destroyed),
        live_shared_handles: SHARED_LIVE.load(Ordering::Relaxed),
    }
}

pub(crate) fn record_pool_created() {
    POOLS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_pool_destroyed() {
    POOLS_DESTROYED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_shared_created() {
    SHARED_LIVE.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_shared_released() {
    SHARED_LIVE.fetch_sub(1, Ordering::Relaxed);
}
