//! Error handling and exit codes.

use poolkit_alloc::AllocError;
use poolkit_core::constants::exit_codes;
use poolkit_core::PoolError;
use poolkit_shim::ShimError;

/// Failures detected by the driver itself.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The runtime reported unreleased retains on exit.
    #[error("{0} retains outstanding at termination")]
    Leak(usize),

    /// A flag or options file is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn pool_code(err: &PoolError) -> i32 {
    match err {
        PoolError::OutOfMemory { .. } => exit_codes::ERROR_OUT_OF_MEMORY,
        PoolError::Config(_) | PoolError::InvalidAlignment(_) => exit_codes::ERROR_CONFIG,
        _ => exit_codes::ERROR_GENERIC,
    }
}

/// Map an application error to the process exit code.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<CliError>() {
            return match err {
                CliError::Leak(_) => exit_codes::ERROR_LEAK,
                CliError::Config(_) => exit_codes::ERROR_CONFIG,
            };
        }
        if cause.is::<serde_json::Error>() {
            return exit_codes::ERROR_CONFIG;
        }
        if let Some(err) = cause.downcast_ref::<AllocError>() {
            return match err {
                AllocError::OutOfMemory { .. } => exit_codes::ERROR_OUT_OF_MEMORY,
                AllocError::InvalidConfig(_) => exit_codes::ERROR_CONFIG,
            };
        }
        if let Some(err) = cause.downcast_ref::<PoolError>() {
            return pool_code(err);
        }
        if let Some(ShimError::Native(err)) = cause.downcast_ref::<ShimError>() {
            return pool_code(err);
        }
    }
    exit_codes::ERROR_GENERIC
}
