//! Derived metrics
//!
//! Turns a [`WorkerResult`] (ticks, passes and raw counter values) into the
//! numbers people read: nanoseconds per access for latency runs and MB/s for
//! throughput runs. A megabyte here is 2^20 bytes.
//!
//! # Example
//!
//! ```
//! use memprobe::stats::{aggregate_throughput, Summary};
//! use memprobe::util::fast_time::Timing;
//! use memprobe::WorkerResult;
//!
//! let result = WorkerResult {
//!     elapsed_ticks: 2_000_000,
//!     elapsed_dummy_ticks: 1_000_000,
//!     adjusted_ticks: 1_000_000,
//!     bytes_per_pass: 4096,
//!     passes: 256,
//!     completed: true,
//!     ..Default::default()
//! };
//!
//! // Monotonic ticks are nanoseconds: 1 MiB moved in 1 ms
//! let summary = Summary::from_result(&result, &Timing::monotonic());
//! assert!((summary.mb_per_sec - 1000.0).abs() < 1e-6);
//! assert!((aggregate_throughput(&[summary, summary]) - 2000.0).abs() < 1e-6);
//! ```

use crate::counters::CounterSample;
use crate::util::fast_time::Timing;
use crate::worker::WorkerResult;
use serde::Serialize;

/// Bytes per reported megabyte
pub const MB: f64 = (1u64 << 20) as f64;

/// Human-facing view of one worker's result
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Summary {
    pub completed: bool,
    pub passes: u64,
    pub total_bytes: u64,
    /// Overhead-adjusted time in nanoseconds
    pub adjusted_ns: f64,
    /// Adjusted nanoseconds per pass (access latency for chase runs)
    pub ns_per_pass: f64,
    /// Adjusted throughput in MB/s
    pub mb_per_sec: f64,
    /// Memory accesses the counters attribute to one pass
    pub accesses_per_pass: f64,
    pub low_confidence: bool,
    pub counters: CounterSample,
}

impl Summary {
    /// Derive metrics from a result
    ///
    /// Incomplete results and non-positive adjusted times yield zero rates.
    pub fn from_result(result: &WorkerResult, timing: &Timing) -> Self {
        let mut summary = Self {
            completed: result.completed,
            passes: result.passes,
            total_bytes: result.total_bytes(),
            low_confidence: result.warning,
            counters: result.counters,
            ..Default::default()
        };

        if !result.completed || result.passes == 0 {
            return summary;
        }

        summary.accesses_per_pass = result.counters.total_accesses() as f64 / result.passes as f64;

        if result.adjusted_ticks > 0 {
            let adjusted_ns = timing.ticks_to_ns(result.adjusted_ticks as f64);
            summary.adjusted_ns = adjusted_ns;
            summary.ns_per_pass = adjusted_ns / result.passes as f64;
            summary.mb_per_sec = summary.total_bytes as f64 / MB / (adjusted_ns / 1e9);
        }
        summary
    }
}

/// Sum of per-worker throughput over completed results
pub fn aggregate_throughput(summaries: &[Summary]) -> f64 {
    summaries
        .iter()
        .filter(|s| s.completed)
        .map(|s| s.mb_per_sec)
        .sum()
}

/// Mean latency over completed results
pub fn mean_ns_per_pass(summaries: &[Summary]) -> Option<f64> {
    let completed: Vec<f64> = summaries
        .iter()
        .filter(|s| s.completed && s.ns_per_pass > 0.0)
        .map(|s| s.ns_per_pass)
        .collect();
    if completed.is_empty() {
        return None;
    }
    Some(completed.iter().sum::<f64>() / completed.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterEvent;
    use crate::util::fast_time::StepClock;
    use std::sync::Arc;

    fn completed(adjusted_ticks: i64, passes: u64, bytes_per_pass: u64) -> WorkerResult {
        WorkerResult {
            elapsed_ticks: adjusted_ticks.max(0) as u64 * 2,
            elapsed_dummy_ticks: adjusted_ticks.max(0) as u64,
            adjusted_ticks,
            bytes_per_pass,
            passes,
            completed: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_latency_ns_per_pass() {
        let result = completed(80_000, 1_000, 64);
        let summary = Summary::from_result(&result, &Timing::monotonic());
        assert!((summary.ns_per_pass - 80.0).abs() < 1e-9);
        assert!(!summary.low_confidence);
    }

    #[test]
    fn test_tick_conversion_uses_ticks_per_ms() {
        // 3000 ticks per ms: 3 ticks per nanosecond
        let timing = Timing::new(Arc::new(StepClock::new(1)), 3_000_000);
        let summary = Summary::from_result(&completed(300, 10, 64), &timing);
        assert!((summary.adjusted_ns - 100.0).abs() < 1e-9);
        assert!((summary.ns_per_pass - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_throughput_mb_per_sec() {
        // 256 MiB in half a second
        let result = completed(500_000_000, 65_536, 4096);
        let summary = Summary::from_result(&result, &Timing::monotonic());
        assert!((summary.mb_per_sec - 512.0).abs() < 1e-6);
    }

    #[test]
    fn test_incomplete_and_negative_yield_zero_rates() {
        let mut result = completed(1_000, 10, 64);
        result.completed = false;
        let summary = Summary::from_result(&result, &Timing::monotonic());
        assert_eq!(summary.ns_per_pass, 0.0);
        assert!(!summary.completed);

        let mut result = completed(-500, 10, 64);
        result.warning = true;
        let summary = Summary::from_result(&result, &Timing::monotonic());
        assert_eq!(summary.mb_per_sec, 0.0);
        assert!(summary.low_confidence);
    }

    #[test]
    fn test_accesses_per_pass() {
        let mut result = completed(1_000, 100, 64);
        result.counters.set(CounterEvent::LocalDramAccess, 150);
        result.counters.set(CounterEvent::RemoteDramAccess, 50);
        result.counters.set(CounterEvent::WritePendingQueueOccupancy, 10_000);
        let summary = Summary::from_result(&result, &Timing::monotonic());
        assert!((summary.accesses_per_pass - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_skips_incomplete() {
        let timing = Timing::monotonic();
        let a = Summary::from_result(&completed(1_000_000_000, 1024, 1024 * 1024), &timing);
        let mut b = a;
        b.completed = false;
        assert!((aggregate_throughput(&[a, b, a]) - 2048.0).abs() < 1e-6);
        assert_eq!(mean_ns_per_pass(&[b]), None);
        let mean = mean_ns_per_pass(&[a, a]).unwrap();
        assert!((mean - a.ns_per_pass).abs() < 1e-9);
    }
}
