//! Application configuration from CLI flags, environment and an options file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use poolkit_alloc::AllocatorConfig;
use poolkit_core::PoolOptions;
use serde::{Deserialize, Serialize};

use crate::errors::CliError;

/// poolkit: hierarchical memory pool workloads and diagnostics.
#[derive(Parser, Debug)]
#[command(name = "poolkit", version, long_version = crate::version::long_version(), about)]
pub struct AppConfig {
    /// Verbose logging (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// JSON file with `allocator` and `pool` option sections.
    #[arg(long, global = true, env = "POOLKIT_OPTIONS")]
    pub options: Option<PathBuf>,

    /// Free-byte budget of the shared allocator (0 = unlimited).
    #[arg(long, global = true, env = "POOLKIT_MAX_FREE")]
    pub max_free: Option<usize>,

    /// Emit JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Churn pools on worker threads that share one allocator.
    Run(RunArgs),
    /// Print the effective allocator and pool options.
    Config,
    /// Resolve the foreign symbol table against the native exports.
    Symbols,
}

/// Workload shape for `poolkit run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Worker threads.
    #[arg(short, long, default_value = "4", env = "POOLKIT_THREADS")]
    pub threads: usize,

    /// Child pools created and destroyed per thread.
    #[arg(short, long, default_value = "1000", env = "POOLKIT_POOLS")]
    pub pools: usize,

    /// Allocations per child pool.
    #[arg(long, default_value = "32")]
    pub allocs: usize,

    /// Largest small allocation in bytes.
    #[arg(long, default_value = "512")]
    pub max_size: usize,

    /// Every Nth child pool also cycles a large block (0 = never).
    #[arg(long, default_value = "8")]
    pub large_every: usize,

    /// Record every retain and fail if any is outstanding at exit.
    #[arg(long)]
    pub track_refs: bool,
}

impl RunArgs {
    /// Reject shapes that cannot run.
    pub fn validate(&self) -> Result<(), CliError> {
        if self.threads == 0 {
            return Err(CliError::Config("--threads must be at least 1".into()));
        }
        if self.max_size == 0 {
            return Err(CliError::Config("--max-size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Options after merging defaults, the options file and flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectiveOptions {
    /// Shared allocator configuration.
    pub allocator: AllocatorConfig,
    /// Options for every pool the driver creates.
    pub pool: PoolOptions,
}

impl AppConfig {
    /// Parse CLI arguments.
    #[must_use]
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Log level selected by `-v`.
    #[must_use]
    pub fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            _ => tracing::Level::DEBUG,
        }
    }

    /// Load the options file, if any, and apply flag overrides.
    pub fn resolve(&self) -> Result<EffectiveOptions> {
        let mut options = match &self.options {
            Some(path) => load_options(path)?,
            None => EffectiveOptions::default(),
        };
        if let Some(max_free) = self.max_free {
            options.allocator.max_free_bytes = max_free;
        }
        options.allocator = options.allocator.normalize();
        options.allocator.validate()?;
        options.pool = options.pool.normalize();
        Ok(options)
    }
}

/// Read an options file.
pub fn load_options(path: &Path) -> Result<EffectiveOptions> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading options file {}", path.display()))?;
    let options = serde_json::from_str(&text)
        .with_context(|| format!("parsing options file {}", path.display()))?;
    Ok(options)
}
