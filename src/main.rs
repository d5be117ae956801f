//! memprobe CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use memprobe::config::cli::{BenchmarkMode, Cli, OpArg};
use memprobe::config::{toml as config_toml, validator, BenchmarkConfig};
use memprobe::counters::CounterEvent;
use memprobe::error::WorkerError;
use memprobe::kernel::builtin::{self, LINE_BYTES};
use memprobe::kernel::{AccessPattern, KernelPair};
use memprobe::stats::{aggregate_throughput, mean_ns_per_pass, Summary};
use memprobe::util::fast_time::Timing;
use memprobe::worker::affinity;
use memprobe::worker::barrier::BarrierCoordinator;
use memprobe::worker::{MemoryWorker, Worker, WorkerResult};
use memprobe::{LatencyWorker, LoadWorker, MemoryRegion, RegionBuffer};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    println!("memprobe v{}", env!("CARGO_PKG_VERSION"));
    println!("Memory latency and bandwidth microbenchmark");
    println!();

    let config = build_config(&cli)?;
    validator::validate_config(&config).context("Configuration validation failed")?;

    let plan = RunPlan::from_cli(&cli, &config)?;
    if cli.mode == BenchmarkMode::Load && plan.pattern == AccessPattern::Sequential {
        validator::validate_load_region(&config.load, plan.bytes_per_worker)
            .context("Configuration validation failed")?;
    }

    print_configuration(&cli, &config, &plan);

    let timing = Timing::from_config(&config.timer).context("Failed to set up timer")?;
    let config = Arc::new(config);
    let workers = build_workers(&cli, &config, &plan, &timing)?;

    println!();
    println!("Running {} worker(s)...", workers.len());
    println!();

    run_workers(&workers)?;

    let results: Vec<WorkerResult> = workers.iter().map(|w| w.get_result()).collect();
    let summaries: Vec<Summary> = results
        .iter()
        .map(|r| Summary::from_result(r, &timing))
        .collect();

    print_results(cli.mode, &plan, &summaries);

    if let Some(ref path) = cli.json {
        write_json(path, &cli, &config, &plan, &timing, &results, &summaries)?;
        println!();
        println!("Results written to {}", path.display());
    }

    Ok(())
}

/// Load the config file (if any) and apply CLI overrides
fn build_config(cli: &Cli) -> Result<BenchmarkConfig> {
    let config = match cli.config {
        Some(ref path) => config_toml::parse_toml_file(path)?,
        None => BenchmarkConfig::default(),
    };
    config_toml::merge_cli_with_config(cli, config)
}

/// Region size, thread count and CPU placement resolved from the CLI
#[derive(Debug)]
struct RunPlan {
    pattern: AccessPattern,
    threads: usize,
    bytes_per_worker: u64,
    cpus: Vec<usize>,
}

impl RunPlan {
    fn from_cli(cli: &Cli, config: &BenchmarkConfig) -> Result<Self> {
        let bytes_per_worker = config_toml::parse_size(&cli.size).context("Invalid --size")?;
        if bytes_per_worker < LINE_BYTES as u64 || bytes_per_worker % LINE_BYTES as u64 != 0 {
            anyhow::bail!(
                "--size must be a non-zero multiple of {} bytes, got {}",
                LINE_BYTES,
                bytes_per_worker
            );
        }

        let threads = match cli.mode {
            BenchmarkMode::Latency => {
                if cli.threads > 1 {
                    tracing::warn!(threads = cli.threads, "latency runs use a single worker; ignoring --threads");
                }
                1
            }
            BenchmarkMode::Load => cli.threads,
        };
        if threads == 0 {
            anyhow::bail!("--threads must be at least 1");
        }

        let cpus = match cli.cpus {
            Some(ref spec) => {
                let cpus = affinity::parse_cpu_list(spec).context("Invalid --cpus")?;
                if cpus.len() < threads {
                    anyhow::bail!("--cpus lists {} CPUs but {} workers were requested", cpus.len(), threads);
                }
                cpus
            }
            None => {
                let online = affinity::num_cpus();
                (0..threads).map(|i| i % online).collect()
            }
        };

        Ok(Self {
            pattern: cli.pattern.into(),
            threads,
            bytes_per_worker,
            cpus,
        })
    }

    fn total_bytes(&self) -> Result<usize> {
        self.bytes_per_worker
            .checked_mul(self.threads as u64)
            .and_then(|total| usize::try_from(total).ok())
            .context("Total region size does not fit in the address space")
    }
}

/// Allocate the region, lay out chains and construct one worker per thread
fn build_workers(
    cli: &Cli,
    config: &Arc<BenchmarkConfig>,
    plan: &RunPlan,
    timing: &Timing,
) -> Result<Vec<Arc<dyn Worker>>> {
    let total = plan.total_bytes()?;
    tracing::info!(bytes = total, "allocating region");
    let region = RegionBuffer::allocate(total).context("Failed to allocate benchmark region")?;
    let slices = region.split(plan.threads, LINE_BYTES)?;

    let barrier = (cli.mode == BenchmarkMode::Load && plan.threads > 1)
        .then(|| Arc::new(BarrierCoordinator::new(plan.threads)));

    let mut workers: Vec<Arc<dyn Worker>> = Vec::with_capacity(plan.threads);
    for (id, slice) in slices.into_iter().enumerate() {
        let cpu = plan.cpus[id];
        let kernels = prepare_kernels(cli, config, plan.pattern, &slice)
            .with_context(|| format!("Failed to prepare region for worker {}", id))?;
        let base = MemoryWorker::new(slice, cpu, Arc::clone(config), timing.clone());

        let worker: Arc<dyn Worker> = match cli.mode {
            BenchmarkMode::Latency => Arc::new(LatencyWorker::new(base, kernels)?),
            BenchmarkMode::Load => Arc::new(LoadWorker::new(base, kernels, barrier.clone())?),
        };
        workers.push(worker);
    }
    Ok(workers)
}

/// Build the chain a slice needs and pick the kernel pair for it
fn prepare_kernels(
    cli: &Cli,
    config: &BenchmarkConfig,
    pattern: AccessPattern,
    slice: &MemoryRegion,
) -> Result<KernelPair> {
    let window = config.latency.chase_window_bytes as usize;
    let seed = config.latency.seed;

    let pair = match (cli.mode, pattern) {
        (BenchmarkMode::Latency, AccessPattern::Sequential) => {
            builtin::build_sequential_chain(slice)?;
            KernelPair::chase(
                AccessPattern::Sequential,
                builtin::SequentialChase,
                builtin::ChaseDummy::Sequential,
            )
        }
        (BenchmarkMode::Latency, AccessPattern::Random) => {
            builtin::build_random_chain(slice, window, seed)?;
            let hops = config.latency.random_passes_per_call as usize;
            KernelPair::chase(
                AccessPattern::Random,
                builtin::WindowedRandomChase::new(hops, window),
                builtin::ChaseDummy::Windowed {
                    hops,
                    window_bytes: window,
                },
            )
        }
        (BenchmarkMode::Load, AccessPattern::Sequential) => match cli.op {
            OpArg::Read => KernelPair::sequential(builtin::ForwardRead, builtin::SequentialDummy),
            OpArg::Write => KernelPair::sequential(builtin::ForwardWrite, builtin::SequentialDummy),
        },
        (BenchmarkMode::Load, AccessPattern::Random) => {
            builtin::build_region_chain(slice, seed)?;
            match cli.op {
                OpArg::Read => KernelPair::random(builtin::RandomRead, builtin::RandomDummy),
                OpArg::Write => KernelPair::random(builtin::RandomWrite, builtin::RandomDummy),
            }
        }
    };
    Ok(pair)
}

/// Run every worker on its own thread
///
/// The first failure is returned as soon as it is reported. Peers released
/// from an aborted rendezvous only echo that failure, so their errors are
/// reported only if nothing else is.
fn run_workers(workers: &[Arc<dyn Worker>]) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::with_capacity(workers.len());

    for (id, worker) in workers.iter().enumerate() {
        let worker = Arc::clone(worker);
        let tx = tx.clone();
        let handle = thread::Builder::new()
            .name(format!("memprobe-{}-{}", worker.kind(), id))
            .spawn(move || {
                let outcome = worker.run();
                // The receiver only goes away after a failure has been reported
                let _ = tx.send((id, outcome));
            })
            .with_context(|| format!("Failed to spawn worker thread {}", id))?;
        handles.push(handle);
    }
    drop(tx);

    let mut aborted = None;
    for (id, outcome) in rx.iter() {
        match outcome {
            Err(e) if matches!(e.downcast_ref::<WorkerError>(), Some(WorkerError::RendezvousAborted)) => {
                aborted.get_or_insert((id, e));
            }
            other => other.with_context(|| format!("Worker {} failed", id))?,
        }
    }
    if let Some((id, e)) = aborted {
        return Err(e).with_context(|| format!("Worker {} failed", id));
    }

    for handle in handles {
        if handle.join().is_err() {
            anyhow::bail!("Worker thread panicked");
        }
    }
    Ok(())
}

fn print_configuration(cli: &Cli, config: &BenchmarkConfig, plan: &RunPlan) {
    println!("Configuration:");
    println!("  Mode:            {:?}", cli.mode);
    println!("  Pattern:         {}", plan.pattern);
    println!("  Region/worker:   {}", format_bytes(plan.bytes_per_worker));
    println!("  Workers:         {}", plan.threads);
    println!("  CPUs:            {:?}", &plan.cpus[..plan.threads]);
    for line in config.to_string().lines() {
        println!("  {}", line);
    }
}

fn print_results(mode: BenchmarkMode, plan: &RunPlan, summaries: &[Summary]) {
    println!("Results:");
    println!(
        "  {:>6} {:>5} {:>16} {:>12} {:>12} {:>10}",
        "worker", "cpu", "passes", "ns/pass", "MB/s", "confidence"
    );
    for (id, s) in summaries.iter().enumerate() {
        println!(
            "  {:>6} {:>5} {:>16} {:>12.2} {:>12.1} {:>10}",
            id,
            plan.cpus[id],
            format_number(s.passes),
            s.ns_per_pass,
            s.mb_per_sec,
            if s.low_confidence { "LOW" } else { "ok" }
        );
    }

    println!();
    match mode {
        BenchmarkMode::Latency => {
            if let Some(ns) = mean_ns_per_pass(summaries) {
                println!("  Latency:         {:.2} ns per access", ns);
            }
        }
        BenchmarkMode::Load => {
            println!("  Aggregate:       {:.1} MB/s", aggregate_throughput(summaries));
        }
    }

    println!();
    println!("Hardware counters:");
    for (id, s) in summaries.iter().enumerate() {
        let counts: Vec<String> = s
            .counters
            .iter()
            .filter(|(event, _)| {
                mode == BenchmarkMode::Load || CounterEvent::ACCESS_EVENTS.contains(event)
            })
            .map(|(event, count)| format!("{}={}", event, format_number(count)))
            .collect();
        println!("  worker {}: {}", id, counts.join(" "));
    }
}

#[derive(Serialize)]
struct WorkerReport {
    id: usize,
    cpu: usize,
    result: WorkerResult,
    summary: Summary,
}

#[derive(Serialize)]
struct Report<'a> {
    timestamp: String,
    version: &'static str,
    mode: &'static str,
    pattern: AccessPattern,
    bytes_per_worker: u64,
    ticks_per_ms: u64,
    config: &'a BenchmarkConfig,
    workers: Vec<WorkerReport>,
    aggregate_mb_per_sec: f64,
    mean_ns_per_pass: Option<f64>,
}

fn write_json(
    path: &Path,
    cli: &Cli,
    config: &BenchmarkConfig,
    plan: &RunPlan,
    timing: &Timing,
    results: &[WorkerResult],
    summaries: &[Summary],
) -> Result<()> {
    let report = Report {
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
        mode: match cli.mode {
            BenchmarkMode::Latency => "latency",
            BenchmarkMode::Load => "load",
        },
        pattern: plan.pattern,
        bytes_per_worker: plan.bytes_per_worker,
        ticks_per_ms: timing.ticks_per_ms,
        config,
        workers: results
            .iter()
            .zip(summaries)
            .enumerate()
            .map(|(id, (result, summary))| WorkerReport {
                id,
                cpu: plan.cpus[id],
                result: *result,
                summary: *summary,
            })
            .collect(),
        aggregate_mb_per_sec: aggregate_throughput(summaries),
        mean_ns_per_pass: mean_ns_per_pass(summaries),
    };

    let file = File::create(path)
        .with_context(|| format!("Failed to create JSON output file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, &report)
        .with_context(|| format!("Failed to write JSON output: {}", path.display()))?;
    Ok(())
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}

/// Format bytes with binary units
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
