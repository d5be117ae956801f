//! CLI argument parsing using clap

use crate::kernel::AccessPattern;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// What to measure
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BenchmarkMode {
    /// Unloaded access latency (dependent pointer chase, one thread)
    Latency,
    /// Sustained throughput, aggregated over all threads
    Load,
}

/// Access pattern as spelled on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PatternArg {
    #[value(alias = "sequential")]
    Seq,
    #[value(alias = "rand")]
    Random,
}

impl From<PatternArg> for AccessPattern {
    fn from(arg: PatternArg) -> Self {
        match arg {
            PatternArg::Seq => AccessPattern::Sequential,
            PatternArg::Random => AccessPattern::Random,
        }
    }
}

/// Kernel operation for load runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OpArg {
    Read,
    Write,
}

/// memprobe - memory subsystem latency and throughput microbenchmark
#[derive(Parser, Debug)]
#[command(name = "memprobe")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Measurement to run: latency or load
    #[arg(value_enum, value_name = "MODE")]
    pub mode: BenchmarkMode,

    // === Region Options ===
    /// Working set size per thread (e.g., 256M, 1G)
    #[arg(short = 's', long, default_value = "256M")]
    pub size: String,

    /// Access pattern
    #[arg(short = 'p', long, value_enum, default_value = "seq")]
    pub pattern: PatternArg,

    /// Kernel operation (load runs only)
    #[arg(long, value_enum, default_value = "read")]
    pub op: OpArg,

    // === Worker Options ===
    /// Number of load worker threads (latency runs always use one)
    #[arg(short = 't', long, default_value = "1")]
    pub threads: usize,

    /// Logical CPUs to pin workers to (e.g., "0,2-3"); worker i gets the i-th entry
    #[arg(long)]
    pub cpus: Option<String>,

    // === Measurement Options ===
    /// Time budget per measurement in milliseconds
    #[arg(short = 'd', long)]
    pub duration_ms: Option<u64>,

    /// Regions at least this large run until fully touched (e.g., 2G)
    #[arg(long)]
    pub full_touch_threshold: Option<String>,

    /// Use the time stamp counter instead of CLOCK_MONOTONIC
    #[arg(long)]
    pub tsc: bool,

    /// Seed for the random chain layout
    #[arg(long)]
    pub seed: Option<u64>,

    /// Run without hardware counters (all counts read zero)
    #[arg(long)]
    pub no_counters: bool,

    // === Configuration & Output ===
    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Write results as JSON to this file
    #[arg(long)]
    pub json: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["memprobe", "latency"]).unwrap();
        assert_eq!(cli.mode, BenchmarkMode::Latency);
        assert_eq!(cli.size, "256M");
        assert_eq!(cli.pattern, PatternArg::Seq);
        assert_eq!(cli.threads, 1);
        assert!(cli.duration_ms.is_none());
        assert!(!cli.no_counters);
    }

    #[test]
    fn test_load_options() {
        let cli = Cli::try_parse_from([
            "memprobe",
            "load",
            "--size",
            "1G",
            "--pattern",
            "random",
            "--threads",
            "4",
            "--cpus",
            "0,2-4",
            "--duration-ms",
            "500",
            "--no-counters",
            "--json",
            "out.json",
        ])
        .unwrap();
        assert_eq!(cli.mode, BenchmarkMode::Load);
        assert_eq!(AccessPattern::from(cli.pattern), AccessPattern::Random);
        assert_eq!(cli.threads, 4);
        assert_eq!(cli.cpus.as_deref(), Some("0,2-4"));
        assert_eq!(cli.duration_ms, Some(500));
        assert!(cli.no_counters);
        assert_eq!(cli.json, Some(PathBuf::from("out.json")));
    }

    #[test]
    fn test_pattern_aliases() {
        let cli = Cli::try_parse_from(["memprobe", "load", "-p", "sequential"]).unwrap();
        assert_eq!(cli.pattern, PatternArg::Seq);
    }

    #[test]
    fn test_mode_required() {
        assert!(Cli::try_parse_from(["memprobe"]).is_err());
        assert!(Cli::try_parse_from(["memprobe", "bandwidth"]).is_err());
    }
}
