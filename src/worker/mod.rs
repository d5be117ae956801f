//! Measurement workers
//!
//! A worker owns one measurement: it is constructed with a region view, a CPU
//! index, the benchmark configuration and a kernel pair, then `run()` executes
//! the whole protocol on the calling thread. The controller reads the outcome
//! through a [`ResultHandle`] once the thread is done.
//!
//! # Architecture
//!
//! - [`MemoryWorker`]: state and lifecycle shared by every worker kind
//!   (at-most-once run, CPU pinning and priority, result publishing)
//! - [`latency::LatencyWorker`]: dependent pointer chase, single thread
//! - [`load::LoadWorker`]: sustained throughput, optionally synchronized with
//!   other load workers through a [`barrier::BarrierCoordinator`]
//! - [`measure`]: the calibrated timed and dummy loops both kinds share
//!
//! # Example
//!
//! ```no_run
//! use memprobe::config::BenchmarkConfig;
//! use memprobe::kernel::{builtin, AccessPattern, KernelPair};
//! use memprobe::util::fast_time::Timing;
//! use memprobe::worker::{latency::LatencyWorker, MemoryWorker, Worker};
//! use memprobe::RegionBuffer;
//! use std::sync::Arc;
//!
//! let region = RegionBuffer::allocate(64 * 1024 * 1024)?;
//! builtin::build_sequential_chain(&region)?;
//!
//! let config = Arc::new(BenchmarkConfig::default());
//! let base = MemoryWorker::new(region, 0, config, Timing::monotonic());
//! let kernels = KernelPair::chase(
//!     AccessPattern::Sequential,
//!     builtin::SequentialChase,
//!     builtin::ChaseDummy::Sequential,
//! );
//! let worker = LatencyWorker::new(base, kernels)?;
//! worker.run()?;
//!
//! let result = worker.get_result();
//! println!("{} passes in {} adjusted ticks", result.passes, result.adjusted_ticks);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod affinity;
pub mod barrier;
pub mod latency;
pub mod load;
pub mod measure;

use crate::config::BenchmarkConfig;
use crate::counters::{self, CounterBackend, CounterSample};
use crate::error::WorkerError;
use crate::util::fast_time::Timing;
use crate::util::region::MemoryRegion;
use crate::Result;
use affinity::{CpuControl, OsCpuControl, RunGuard};
use measure::{calibrate, LoopOutcome};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Outcome of one measurement
///
/// Fields are meaningful only when `completed` is true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerResult {
    pub elapsed_ticks: u64,
    pub elapsed_dummy_ticks: u64,
    /// `elapsed_ticks - elapsed_dummy_ticks`, negative when the dummy was slower
    pub adjusted_ticks: i64,
    pub bytes_per_pass: u64,
    pub passes: u64,
    pub completed: bool,
    /// Low-confidence flag; the measurement is still valid
    pub warning: bool,
    pub counters: CounterSample,
}

impl WorkerResult {
    /// Combine the measured and dummy loops into a result
    pub fn from_loops(
        measured: LoopOutcome,
        elapsed_dummy_ticks: u64,
        bytes_per_pass: u64,
        counters: CounterSample,
        min_elapsed_ticks: u64,
    ) -> Self {
        let calibration = calibrate(measured.elapsed_ticks, elapsed_dummy_ticks, min_elapsed_ticks);
        Self {
            elapsed_ticks: measured.elapsed_ticks,
            elapsed_dummy_ticks,
            adjusted_ticks: calibration.adjusted_ticks,
            bytes_per_pass,
            passes: measured.passes,
            completed: false,
            warning: calibration.warning,
            counters,
        }
    }

    /// Bytes moved by the measured loop
    pub fn total_bytes(&self) -> u64 {
        self.passes.saturating_mul(self.bytes_per_pass)
    }
}

#[derive(Debug, Default)]
struct ResultState {
    started: bool,
    result: WorkerResult,
}

/// Lock-guarded result cell shared between a worker and its readers
///
/// Clones refer to the same cell, so the controller can keep a handle while
/// the worker itself moves to its thread.
#[derive(Debug, Clone, Default)]
pub struct ResultHandle {
    state: Arc<Mutex<ResultState>>,
}

impl ResultHandle {
    /// Snapshot of the current result; check `completed` before using it
    pub fn get(&self) -> WorkerResult {
        self.lock().result
    }

    /// Whether `run()` has been entered
    pub fn started(&self) -> bool {
        self.lock().started
    }

    fn lock(&self) -> MutexGuard<'_, ResultState> {
        // The state is plain data, so a panic elsewhere cannot leave it torn
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self) -> std::result::Result<(), WorkerError> {
        let mut state = self.lock();
        if state.started {
            return Err(WorkerError::AlreadyRun);
        }
        state.started = true;
        Ok(())
    }

    fn publish(&self, mut result: WorkerResult) {
        result.completed = true;
        self.lock().result = result;
    }
}

/// Common worker interface used by the controller
pub trait Worker: Send + Sync {
    /// Execute the measurement protocol on the calling thread
    ///
    /// May be called at most once.
    fn run(&self) -> Result<()>;

    /// Snapshot of the published result
    fn get_result(&self) -> WorkerResult;

    /// Short name for logs and reports
    fn kind(&self) -> &'static str;
}

/// State shared by every worker kind
///
/// Everything here is fixed at construction. The only mutable state is the
/// [`ResultHandle`].
pub struct MemoryWorker {
    region: MemoryRegion,
    cpu: usize,
    config: Arc<BenchmarkConfig>,
    timing: Timing,
    counters: Arc<dyn CounterBackend>,
    cpu_control: Arc<dyn CpuControl>,
    result: ResultHandle,
}

impl MemoryWorker {
    /// Worker base using the configured counter backend and the OS CPU control
    pub fn new(region: MemoryRegion, cpu: usize, config: Arc<BenchmarkConfig>, timing: Timing) -> Self {
        let counters = counters::backend_for(&config.counters);
        Self {
            region,
            cpu,
            config,
            timing,
            counters,
            cpu_control: Arc::new(OsCpuControl),
            result: ResultHandle::default(),
        }
    }

    /// Replace the hardware counter backend
    pub fn with_counters(mut self, counters: Arc<dyn CounterBackend>) -> Self {
        self.counters = counters;
        self
    }

    /// Replace the affinity and priority backend
    pub fn with_cpu_control(mut self, cpu_control: Arc<dyn CpuControl>) -> Self {
        self.cpu_control = cpu_control;
        self
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn counters(&self) -> &dyn CounterBackend {
        self.counters.as_ref()
    }

    /// Handle for reading the result from another thread
    pub fn result_handle(&self) -> ResultHandle {
        self.result.clone()
    }

    pub fn get_result(&self) -> WorkerResult {
        self.result.get()
    }

    /// Run `measure` once, pinned and at raised priority, and publish its result
    ///
    /// Pinning and priority are released before the result is published and on
    /// every error path. Nothing is published when `measure` fails.
    pub(crate) fn execute<F>(&self, kind: &'static str, measure: F) -> Result<()>
    where
        F: FnOnce() -> Result<WorkerResult>,
    {
        self.result.claim()?;

        let outcome = {
            let _guard = RunGuard::acquire(self.cpu_control.as_ref(), self.cpu);
            measure()
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(worker = kind, cpu = self.cpu, error = %format!("{:#}", e), "measurement aborted");
                return Err(e);
            }
        };

        tracing::info!(
            worker = kind,
            cpu = self.cpu,
            passes = result.passes,
            elapsed_ticks = result.elapsed_ticks,
            elapsed_dummy_ticks = result.elapsed_dummy_ticks,
            adjusted_ticks = result.adjusted_ticks,
            warning = result.warning,
            counters = ?result.counters,
            "measurement complete"
        );
        if result.warning {
            tracing::warn!(worker = kind, cpu = self.cpu, "result is low confidence; consider a longer duration");
        }

        self.result.publish(result);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWorker")
            .field("region", &self.region)
            .field("cpu", &self.cpu)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}
