//! Foreign interface loading and the process-wide instance.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::error::ShimError;
use crate::symbols::{ExportRegistry, ForeignTable, SymbolSource};

/// Outcome of resolving the foreign function table.
///
/// An inert interface never becomes ready; every call routed through it
/// logs and fails.
#[derive(Debug)]
pub enum ForeignInterface {
    /// Every symbol resolved.
    Ready(ForeignTable),
    /// Resolution failed.
    Inert {
        /// Why the backend is unavailable.
        reason: String,
    },
}

impl ForeignInterface {
    /// Resolve the table from `source`, going inert on any failure.
    pub fn load(source: &dyn SymbolSource) -> Self {
        match ForeignTable::resolve(source) {
            Ok(table) => {
                info!("foreign pool backend ready");
                Self::Ready(table)
            }
            Err(err) => {
                warn!(%err, "foreign pool backend inert");
                Self::Inert {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// An interface that is inert for the given reason.
    pub fn inert(reason: impl Into<String>) -> Self {
        Self::Inert {
            reason: reason.into(),
        }
    }

    /// Whether the table resolved.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The table, or an error for a call to `symbol` on an inert backend.
    pub fn table(&self, symbol: &'static str) -> Result<&ForeignTable, ShimError> {
        match self {
            Self::Ready(table) => Ok(table),
            Self::Inert { reason } => {
                error!(symbol, reason = reason.as_str(), "foreign call on inert backend");
                Err(ShimError::BackendUnavailable(reason.clone()))
            }
        }
    }
}

static INTERFACE: RwLock<Option<Arc<ForeignInterface>>> = parking_lot::const_rwlock(None);

/// Resolve the process-wide interface from the global export registry.
///
/// Idempotent: a second call returns the interface loaded by the first.
pub fn init() -> Arc<ForeignInterface> {
    init_from(ExportRegistry::global())
}

/// Resolve the process-wide interface from `source`, unless one is loaded.
pub fn init_from(source: &dyn SymbolSource) -> Arc<ForeignInterface> {
    let mut slot = INTERFACE.write();
    if let Some(existing) = slot.as_ref() {
        return Arc::clone(existing);
    }
    let interface = Arc::new(ForeignInterface::load(source));
    *slot = Some(Arc::clone(&interface));
    interface
}

/// The process-wide interface; inert if [`init`] has not run.
pub fn interface() -> Arc<ForeignInterface> {
    INTERFACE
        .read()
        .as_ref()
        .map_or_else(|| Arc::new(ForeignInterface::inert("shim not initialized")), Arc::clone)
}

/// Drop the process-wide interface. Handles created from it keep their own
/// reference.
pub fn terminate() -> bool {
    INTERFACE.write().take().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_is_inert() {
        let iface = ForeignInterface::load(&ExportRegistry::new());
        assert!(!iface.is_ready());
        assert!(matches!(
            iface.table("poolkit_palloc"),
            Err(ShimError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn inert_reason_is_kept() {
        let iface = ForeignInterface::inert("no backend linked");
        match iface.table("poolkit_free") {
            Err(ShimError::BackendUnavailable(reason)) => assert_eq!(reason, "no backend linked"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
