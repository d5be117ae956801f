//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! Every tunable that shapes a measurement lives in [`BenchmarkConfig`] and is
//! handed to workers at construction time. Nothing here is process-global.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::counters::{CounterEvent, EventSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One gibibyte
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Complete benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub timer: TimerConfig,
    /// Time budget per measurement in milliseconds
    pub duration_ms: u64,
    /// Measured loops shorter than this are flagged as low confidence
    pub min_elapsed_ticks: u64,
    /// Regions at least this large are measured until fully touched
    pub large_region_threshold: u64,
    pub latency: LatencyConfig,
    pub load: LoadConfig,
    pub counters: CounterConfig,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            timer: TimerConfig::default(),
            duration_ms: 250,
            min_elapsed_ticks: 10_000,
            large_region_threshold: 2 * GIB,
            latency: LatencyConfig::default(),
            load: LoadConfig::default(),
            counters: CounterConfig::default(),
        }
    }
}

/// Tick source selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimerSource {
    /// CLOCK_MONOTONIC, one tick per nanosecond
    #[default]
    Monotonic,
    /// Time stamp counter (x86_64 only)
    Tsc,
}

/// Timer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub source: TimerSource,
    /// Fixed ticks per millisecond; measured at startup when absent
    pub ticks_per_ms: Option<u64>,
    /// Calibration window used when `ticks_per_ms` is absent
    pub calibration_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            source: TimerSource::Monotonic,
            ticks_per_ms: None,
            calibration_ms: 100,
        }
    }
}

/// Latency (pointer chase) measurement parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Chase calls per timed segment for the sequential order
    pub unroll: u64,
    /// Passes (hops) performed by one random-order chase call
    pub random_passes_per_call: u64,
    /// Bytes covered by one pass (one chased cache line)
    pub bytes_per_pass: u64,
    /// Full sequential sweeps over the region before measuring
    pub prime_passes: u32,
    /// Window of the exhaustive random visiting order
    pub chase_window_bytes: u64,
    /// Seed for the random chain layout
    pub seed: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            unroll: 256,
            random_passes_per_call: 4096,
            bytes_per_pass: 64,
            prime_passes: 4,
            chase_window_bytes: 1024 * 1024,
            seed: 0x6d65_6d70_726f_6265,
        }
    }
}

/// Throughput measurement parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Kernel calls per timed segment
    pub unroll: u64,
    /// Bytes moved by one kernel call
    pub bytes_per_pass: u64,
    /// Passes counted per kernel call
    pub passes_per_call: u64,
    /// Full sequential sweeps over the primed extent before measuring
    pub prime_passes: u32,
    /// Private warm-up extent primed before the first rendezvous
    pub warmup_bytes: u64,
    /// Primed extent of the region; whole region when absent
    pub prime_bytes: Option<u64>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            unroll: 1024,
            bytes_per_pass: 4096,
            passes_per_call: 1,
            prime_passes: 4,
            warmup_bytes: 4 * 1024 * 1024,
            prime_bytes: None,
        }
    }
}

/// Counter backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackendKind {
    /// Linux perf_event raw events
    #[default]
    Perf,
    /// Explicit opt-out; every count reads zero
    None,
}

/// Hardware counter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    pub backend: CounterBackendKind,
    /// Raw event code overrides keyed by event name (vendor specific)
    pub raw_overrides: BTreeMap<String, u64>,
}

impl CounterConfig {
    /// Event specs for latency runs (access events only)
    pub fn latency_events(&self) -> Vec<EventSpec> {
        self.specs(&CounterEvent::ACCESS_EVENTS)
    }

    /// Event specs for throughput runs (access and queue occupancy events)
    pub fn load_events(&self) -> Vec<EventSpec> {
        self.specs(&CounterEvent::ALL)
    }

    fn specs(&self, events: &[CounterEvent]) -> Vec<EventSpec> {
        events
            .iter()
            .map(|&event| EventSpec {
                event,
                raw: self
                    .raw_overrides
                    .get(event.name())
                    .copied()
                    .unwrap_or_else(|| event.default_raw()),
            })
            .collect()
    }
}

impl fmt::Display for BenchmarkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Duration:        {} ms", self.duration_ms)?;
        writeln!(f, "Min ticks:       {}", self.min_elapsed_ticks)?;
        writeln!(f, "Full touch at:   {} bytes", self.large_region_threshold)?;
        writeln!(f, "Timer:           {:?}", self.timer.source)?;
        writeln!(
            f,
            "Latency:         unroll {}, {} B/pass",
            self.latency.unroll, self.latency.bytes_per_pass
        )?;
        writeln!(
            f,
            "Load:            unroll {}, {} B/pass",
            self.load.unroll, self.load.bytes_per_pass
        )?;
        write!(f, "Counters:        {:?}", self.counters.backend)
    }
}
