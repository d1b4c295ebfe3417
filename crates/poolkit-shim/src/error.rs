//! Shim error types.

use poolkit_core::PoolError;

/// Errors raised by the compatibility shim.
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    /// The foreign backend is inert; the reason is the load failure.
    #[error("foreign backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Required symbols did not resolve.
    #[error("missing foreign symbols: {}", .0.join(", "))]
    MissingSymbols(Vec<&'static str>),

    /// A symbol resolved to a function of the wrong shape.
    #[error("symbol {0} has an unexpected signature")]
    SignatureMismatch(&'static str),

    /// A foreign function reported failure.
    #[error("foreign call {0} failed")]
    ForeignFailure(&'static str),

    /// Native and foreign handles were mixed in one call.
    #[error("cannot combine a {expected} handle with a {found} handle")]
    KindMismatch {
        /// Kind required by the operation.
        expected: crate::PoolKind,
        /// Kind actually supplied.
        found: crate::PoolKind,
    },

    /// The handle is not known to the native export table.
    #[error("unknown native handle {0}")]
    UnknownHandle(u64),

    /// The native implementation failed.
    #[error(transparent)]
    Native(#[from] PoolError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PoolKind;

    #[test]
    fn missing_symbols_are_listed() {
        let err = ShimError::MissingSymbols(vec!["pool_create", "palloc"]);
        assert_eq!(err.to_string(), "missing foreign symbols: pool_create, palloc");
    }

    #[test]
    fn kind_mismatch_message() {
        let err = ShimError::KindMismatch {
            expected: PoolKind::Native,
            found: PoolKind::Foreign,
        };
        assert_eq!(
            err.to_string(),
            "cannot combine a native handle with a foreign handle"
        );
    }

    #[test]
    fn native_errors_pass_through() {
        let err: ShimError = PoolError::StalePool.into();
        assert_eq!(err.to_string(), PoolError::StalePool.to_string());
    }
}
