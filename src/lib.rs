//! memprobe - Memory subsystem microbenchmark engine
//!
//! memprobe characterizes the latency and throughput of a memory subsystem
//! (local DRAM, persistent memory, NUMA-remote memory) under controlled access
//! patterns, and uses hardware performance counters to attribute observed time
//! to actual memory traffic.
//!
//! # Architecture
//!
//! - **Workers**: `LatencyWorker` (dependent pointer chase) and `LoadWorker`
//!   (sequential window / random chase throughput), each run on its own thread
//! - **Calibration**: every measured loop is paired with a structurally identical
//!   dummy loop whose time is subtracted from the result
//! - **Hardware counters**: raw perf events sampled around the measured loop only
//! - **Barrier protocol**: several `LoadWorker`s can rendezvous to start their
//!   timed sections together for aggregate-bandwidth measurements

pub mod config;
pub mod counters;
pub mod error;
pub mod kernel;
pub mod stats;
pub mod util;
pub mod worker;

// Re-export commonly used types
pub use config::BenchmarkConfig;
pub use util::region::{MemoryRegion, RegionBuffer};
pub use worker::{latency::LatencyWorker, load::LoadWorker, Worker, WorkerResult};

/// Result type used throughout memprobe
pub type Result<T> = anyhow::Result<T>;
