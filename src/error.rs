//! Typed errors
//!
//! Most of memprobe returns `anyhow::Result`, the same as the rest of the crate.
//! The errors below are the ones callers are expected to match on: a counter
//! facility that cannot be opened aborts a run, and worker construction or
//! re-entry mistakes are programming errors in the controller.

use crate::counters::CounterEvent;
use thiserror::Error;

/// Hardware counter facility failures
#[derive(Debug, Error)]
pub enum CounterError {
    /// The kernel refused to open a raw event
    #[error(
        "failed to open hardware counter {event} (raw config {raw:#x}): {source}; \
         reading raw memory events usually needs root or kernel.perf_event_paranoid <= 0"
    )]
    Open {
        event: CounterEvent,
        raw: u64,
        #[source]
        source: std::io::Error,
    },

    /// No counter facility exists on this platform
    #[error("hardware counters are only supported on Linux")]
    Unsupported,
}

/// Worker construction and lifecycle errors
#[derive(Debug, Error)]
pub enum WorkerError {
    /// `run()` was called a second time
    #[error("worker has already been run; launch a fresh worker to measure again")]
    AlreadyRun,

    /// The kernel pair has a shape this worker cannot drive
    #[error("{worker} cannot run {shape} kernels")]
    KernelMismatch {
        worker: &'static str,
        shape: &'static str,
    },

    /// Another worker in a synchronized run failed before its timed loop
    #[error("synchronized run aborted: another worker failed before the timed loop")]
    RendezvousAborted,

    /// The region cannot be traversed with the configured pass size
    #[error("region of {len} bytes is not a non-zero multiple of {bytes_per_pass} bytes per pass")]
    InvalidRegion { len: usize, bytes_per_pass: usize },
}
