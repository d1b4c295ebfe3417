//! Application entry point and dispatch.

use std::cell::Cell;
use std::rc::Rc as LocalRc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use poolkit_alloc::{Allocator, AllocatorStats};
use poolkit_core::{runtime, Diagnostics, Pool, PoolError, PoolOptions, Rc, Ref, RefCount, RuntimeConfig};
use poolkit_shim::{ExportRegistry, ForeignInterface, PoolHandle, ShimError, SYMBOL_NAMES};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{AppConfig, Command, EffectiveOptions, RunArgs};
use crate::errors::CliError;

/// Run the application.
pub fn run(config: &AppConfig) -> Result<()> {
    let options = config.resolve()?;
    match &config.command {
        Command::Run(args) => run_workload(args, &options, config.json),
        Command::Config => print_config(&options),
        Command::Symbols => check_symbols(config.json),
    }
}

fn print_config(options: &EffectiveOptions) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(options)?);
    Ok(())
}

/// Counters summed over all workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadTotals {
    /// Child pools created and destroyed.
    pub pools: u64,
    /// Small allocations served.
    pub allocations: u64,
    /// Bytes requested by small allocations.
    pub bytes: u64,
    /// Cleanups that ran.
    pub cleanups_run: u64,
    /// Large requests served from a pool's reuse list.
    pub large_hits: u64,
    /// Tracked objects whose last reference was released.
    pub objects_released: u64,
}

impl WorkloadTotals {
    fn merge(self, other: Self) -> Self {
        Self {
            pools: self.pools + other.pools,
            allocations: self.allocations + other.allocations,
            bytes: self.bytes + other.bytes,
            cleanups_run: self.cleanups_run + other.cleanups_run,
            large_hits: self.large_hits + other.large_hits,
            objects_released: self.objects_released + other.objects_released,
        }
    }
}

/// Everything `poolkit run` prints.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Worker threads used.
    pub threads: usize,
    /// Wall time in milliseconds.
    pub elapsed_ms: u128,
    /// Workload counters.
    pub totals: WorkloadTotals,
    /// Shared allocator statistics after the run.
    pub allocator: AllocatorStats,
    /// Process-wide pool counters.
    pub diagnostics: Diagnostics,
}

/// Refcounted token cycled once per child pool.
struct Token {
    refs: RefCount,
    released: LocalRc<Cell<u64>>,
}

impl Ref for Token {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }

    fn on_last_release(&self) {
        self.released.set(self.released.get() + 1);
    }
}

/// One worker: a root pool on the shared allocator, churned by children.
pub fn churn(
    allocator: &Arc<Allocator>,
    options: &PoolOptions,
    args: &RunArgs,
    worker: usize,
) -> Result<WorkloadTotals, PoolError> {
    let root = Pool::with_allocator_and_options(Arc::clone(allocator), options.clone())?;
    root.set_tag(&format!("worker-{worker}"))?;

    let cleanups = LocalRc::new(Cell::new(0_u64));
    let released = LocalRc::new(Cell::new(0_u64));
    let mut rng = SmallRng::seed_from_u64(worker as u64);
    let mut totals = WorkloadTotals::default();

    for round in 0..args.pools {
        let child = root.create_child()?;
        for _ in 0..args.allocs {
            let size = rng.gen_range(1..=args.max_size);
            let alloc = child.palloc(size)?;
            child.bytes_mut(&alloc)?.fill(0xA5);
            totals.allocations += 1;
            totals.bytes += size as u64;
        }

        if args.large_every > 0 && round % args.large_every == 0 {
            let size = options.large_threshold;
            let first = child.palloc(size + size / 2)?;
            child.free(&first, size + size / 2)?;
            child.palloc(size)?;
        }

        let token = Rc::alloc(
            &child,
            Token {
                refs: RefCount::new(),
                released: LocalRc::clone(&released),
            },
        )?;
        let extra = token.clone();
        drop(token);
        let counter = LocalRc::clone(&cleanups);
        child.cleanup_register(move || {
            drop(extra);
            counter.set(counter.get() + 1);
        })?;

        totals.large_hits += child.stats()?.large.hits;
        child.destroy()?;
        totals.pools += 1;
    }

    debug!(worker, pools = totals.pools, "worker finished");
    root.destroy()?;
    totals.cleanups_run = cleanups.get();
    totals.objects_released = released.get();
    Ok(totals)
}

fn run_workload(args: &RunArgs, options: &EffectiveOptions, json: bool) -> Result<()> {
    args.validate()?;

    let mut runtime_config = RuntimeConfig::from_env();
    runtime_config.track_refs |= args.track_refs;
    runtime::init(runtime_config)?;

    let allocator = Arc::new(Allocator::new(options.allocator.clone())?);
    let workers = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build()
        .context("building worker pool")?;

    info!(threads = args.threads, pools = args.pools, "workload starting");
    let start = Instant::now();
    let outcome = workers.install(|| {
        (0..args.threads)
            .into_par_iter()
            .map(|worker| churn(&allocator, &options.pool, args, worker))
            .try_reduce(WorkloadTotals::default, |a, b| Ok(a.merge(b)))
    });
    let elapsed = start.elapsed();

    let report = runtime::terminate()?;
    let totals = outcome?;
    if !report.is_clean() {
        if !report.details.is_empty() {
            eprintln!("{}", report.details);
        }
        return Err(CliError::Leak(report.outstanding_retains.max(report.live_pools)).into());
    }

    print_report(
        &RunReport {
            threads: args.threads,
            elapsed_ms: elapsed.as_millis(),
            totals,
            allocator: allocator.stats(),
            diagnostics: runtime::diagnostics(),
        },
        elapsed,
        json,
    )
}

fn print_report(report: &RunReport, elapsed: Duration, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let t = &report.totals;
    let a = &report.allocator;
    println!("threads:          {}", report.threads);
    println!("elapsed:          {elapsed:.3?}");
    println!("pools:            {}", t.pools);
    println!("allocations:      {} ({} bytes)", t.allocations, t.bytes);
    println!("cleanups run:     {}", t.cleanups_run);
    println!("large reuse hits: {}", t.large_hits);
    println!("objects released: {}", t.objects_released);
    println!("allocator hits:   {}", a.hits);
    println!("allocator misses: {}", a.misses);
    println!("evictions:        {}", a.evictions);
    println!("allocated bytes:  {}", a.allocated_bytes);
    println!("cached bytes:     {}", a.cached_bytes);
    Ok(())
}

/// Per-symbol resolution result.
#[derive(Debug, Serialize)]
struct SymbolReport {
    ready: bool,
    symbols: Vec<(&'static str, bool)>,
    round_trip: bool,
}

fn check_symbols(json: bool) -> Result<()> {
    let registry = ExportRegistry::new();
    poolkit_shim::publish_native(&registry);
    let table = poolkit_shim::ForeignTable::resolve(&registry);
    let missing = match &table {
        Ok(table) => table.unresolved(),
        Err(ShimError::MissingSymbols(names)) => names.clone(),
        Err(_) => SYMBOL_NAMES.to_vec(),
    };
    let interface = Arc::new(ForeignInterface::load(&registry));

    let round_trip = interface.is_ready() && {
        let exported = poolkit_shim::exported_pools();
        let pool = PoolHandle::foreign(&interface, None)?;
        let copied = pool.strdup("poolkit")?;
        pool.set_tag("symbols")?;
        let ok = copied.addr() != 0
            && pool.kind() == poolkit_shim::PoolKind::Foreign
            && pool.tag()?.as_deref() == Some("symbols");
        pool.destroy()?;
        ok && poolkit_shim::exported_pools() == exported
    };

    let report = SymbolReport {
        ready: interface.is_ready(),
        symbols: SYMBOL_NAMES
            .iter()
            .map(|name| (*name, !missing.contains(name)))
            .collect(),
        round_trip,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for (name, resolved) in &report.symbols {
            println!("{:<34} {}", name, if *resolved { "ok" } else { "missing" });
        }
        println!("backend: {}", if report.ready { "ready" } else { "inert" });
        println!("round trip: {}", if report.round_trip { "ok" } else { "failed" });
    }
    Ok(())
}
