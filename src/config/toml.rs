//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<BenchmarkConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
///
/// Every field has a default, so an empty document yields
/// `BenchmarkConfig::default()`.
pub fn parse_toml_string(contents: &str) -> Result<BenchmarkConfig> {
    let config: BenchmarkConfig = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    for name in config.counters.raw_overrides.keys() {
        if CounterEvent::from_name(name).is_none() {
            anyhow::bail!("Unknown counter event in raw_overrides: {}", name);
        }
    }

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: BenchmarkConfig) -> Result<BenchmarkConfig> {
    if let Some(duration_ms) = cli.duration_ms {
        config.duration_ms = duration_ms;
    }

    if let Some(ref threshold) = cli.full_touch_threshold {
        config.large_region_threshold = parse_size(threshold)
            .context("Invalid --full-touch-threshold")?;
    }

    if cli.tsc {
        config.timer.source = TimerSource::Tsc;
    }

    if let Some(seed) = cli.seed {
        config.latency.seed = seed;
    }

    // Only an explicit flag disables counters; a config file cannot be overridden back on
    if cli.no_counters {
        config.counters.backend = CounterBackendKind::None;
    }

    Ok(config)
}

/// Parse size string (e.g., "1G", "100M", "4k") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    if s.is_empty() {
        anyhow::bail!("Empty size string");
    }

    let s = s.strip_suffix("IB").or_else(|| s.strip_suffix('B')).unwrap_or(&s);

    let (num_str, multiplier) = if let Some(num) = s.strip_suffix('K') {
        (num, 1024u64)
    } else if let Some(num) = s.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('T') {
        (num, 1024 * 1024 * 1024 * 1024)
    } else {
        (s, 1)
    };

    let num: u64 = num_str.parse()
        .with_context(|| format!("Invalid number in size: {}", num_str))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size {} overflows 64 bits", s))
}
