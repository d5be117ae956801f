//! Sustained throughput
//!
//! A [`LoadWorker`] drives either a sequential window or a random chain through
//! its region and reports how many passes it completed. One kernel call moves
//! `bytes_per_pass * passes_per_call` bytes and counts `passes_per_call` passes.
//!
//! # Synchronized runs
//!
//! When several load workers share a [`BarrierCoordinator`] they run this
//! protocol to measure aggregate bandwidth:
//!
//! 1. prime a private warm-up extent (`warmup_bytes`)
//! 2. rendezvous
//! 3. prime the rest of the region
//! 4. reset and enable counters
//! 5. rendezvous
//! 6. run the timed loop to this worker's own completion condition
//!
//! There is no synchronization after the second rendezvous. A worker that fails
//! before it (counters refused, bad priming extent) aborts the coordinator, so
//! its peers return [`WorkerError::RendezvousAborted`] instead of blocking.

use super::barrier::BarrierCoordinator;
use super::measure::{dummy_loop, termination_for, timed_loop, LoopShape};
use super::{MemoryWorker, Worker, WorkerResult};
use crate::error::WorkerError;
use crate::kernel::{builtin, KernelPair, RandomKernel, SequentialKernel, SequentialWindow};
use crate::util::region::{MemoryRegion, WORD_BYTES};
use crate::Result;
use anyhow::Context;
use std::sync::Arc;

enum LoadKernels {
    Sequential {
        measured: Arc<dyn SequentialKernel>,
        dummy: Arc<dyn SequentialKernel>,
    },
    Random {
        measured: Arc<dyn RandomKernel>,
        dummy: Arc<dyn RandomKernel>,
    },
}

/// Throughput worker, standalone or barrier-synchronized
pub struct LoadWorker {
    base: MemoryWorker,
    kernels: LoadKernels,
    barrier: Option<Arc<BarrierCoordinator>>,
}

impl LoadWorker {
    /// Build a load worker
    ///
    /// Pass a barrier to take part in a synchronized aggregate run.
    ///
    /// Random kernels follow the chain stored in the region and carry no
    /// cursor, so the chain must be one cycle through every line, as laid out
    /// by [`builtin::build_region_chain`].
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::KernelMismatch`] for chase kernels. The sequential
    /// pattern needs a region that is a non-zero multiple of the bytes moved per
    /// call, and the random pattern one that holds at least one call, otherwise
    /// [`WorkerError::InvalidRegion`] is returned.
    pub fn new(
        base: MemoryWorker,
        kernels: KernelPair,
        barrier: Option<Arc<BarrierCoordinator>>,
    ) -> std::result::Result<Self, WorkerError> {
        let len = base.region().len();
        let bytes_per_call = bytes_per_call(base.config()) as usize;

        let kernels = match kernels {
            KernelPair::Sequential { measured, dummy } => {
                if bytes_per_call == 0 || len == 0 || len % bytes_per_call != 0 {
                    return Err(WorkerError::InvalidRegion {
                        len,
                        bytes_per_pass: bytes_per_call,
                    });
                }
                LoadKernels::Sequential { measured, dummy }
            }
            KernelPair::Random { measured, dummy } => {
                if bytes_per_call == 0 || len < bytes_per_call {
                    return Err(WorkerError::InvalidRegion {
                        len,
                        bytes_per_pass: bytes_per_call,
                    });
                }
                LoadKernels::Random { measured, dummy }
            }
            other => {
                return Err(WorkerError::KernelMismatch {
                    worker: "LoadWorker",
                    shape: other.shape(),
                })
            }
        };

        Ok(Self {
            base,
            kernels,
            barrier,
        })
    }

    pub fn base(&self) -> &MemoryWorker {
        &self.base
    }

    pub fn is_synchronized(&self) -> bool {
        self.barrier.is_some()
    }

    fn shape(&self) -> LoopShape {
        let load = &self.base.config().load;
        LoopShape {
            calls_per_segment: load.unroll,
            passes_per_call: load.passes_per_call,
        }
    }

    fn rendezvous(&self, phase: &'static str) -> Result<()> {
        if let Some(barrier) = &self.barrier {
            tracing::debug!(cpu = self.base.cpu(), phase, parties = barrier.parties(), "waiting at barrier");
            barrier.wait()?;
        }
        Ok(())
    }

    /// Abort the rendezvous if `result` failed, so peers stop waiting for us
    fn abort_on_error<T>(&self, result: Result<T>) -> Result<T> {
        if let (Err(e), Some(barrier)) = (&result, &self.barrier) {
            tracing::debug!(cpu = self.base.cpu(), error = %format!("{:#}", e), "leaving synchronized run");
            barrier.abort();
        }
        result
    }

    /// Prime the warm-up extent, rendezvous, then prime the remainder
    fn warm_up(&self) -> Result<()> {
        let config = self.base.config();
        let region = self.base.region();
        let passes = config.load.prime_passes;

        let prime_end = config
            .load
            .prime_bytes
            .map_or(region.len(), |bytes| (bytes as usize).min(region.len()));
        let prime_end = prime_end / WORD_BYTES * WORD_BYTES;
        let warmup_end = (config.load.warmup_bytes as usize).min(prime_end) / WORD_BYTES * WORD_BYTES;

        let warmup = region.slice(0..warmup_end).context("Invalid warm-up extent")?;
        builtin::prime(&warmup, passes);

        self.rendezvous("prime")?;

        let remainder = region
            .slice(warmup_end..prime_end)
            .context("Invalid priming extent")?;
        builtin::prime(&remainder, passes);
        Ok(())
    }

    fn measure(&self) -> Result<WorkerResult> {
        let base = &self.base;
        let config = base.config();
        let region = base.region();
        let clock = base.timing().clock.as_ref();
        let bytes_per_pass = config.load.bytes_per_pass;
        let bytes_per_call = bytes_per_call(config) as usize;

        let opened = base
            .counters()
            .open(&config.counters.load_events())
            .map_err(anyhow::Error::from);
        let mut handles = self.abort_on_error(opened)?;

        self.abort_on_error(self.warm_up())?;

        let termination = termination_for(region.len(), config, base.timing());
        let shape = self.shape();
        tracing::debug!(
            cpu = base.cpu(),
            pattern = self.pattern_name(),
            ?termination,
            ?shape,
            region_bytes = region.len(),
            synchronized = self.is_synchronized(),
            "starting load measurement"
        );

        handles.reset();
        handles.enable();
        self.rendezvous("timed loop")?;

        let outcome = match &self.kernels {
            LoadKernels::Sequential { measured, .. } => timed_loop(
                clock,
                termination,
                shape,
                window_segment(measured.as_ref(), region, shape, bytes_per_call),
            ),
            LoadKernels::Random { measured, .. } => timed_loop(
                clock,
                termination,
                shape,
                chain_segment(measured.as_ref(), region, shape, bytes_per_pass),
            ),
        };

        handles.disable();
        let counters = handles.read();
        handles.close();

        let elapsed_dummy_ticks = match &self.kernels {
            LoadKernels::Sequential { dummy, .. } => dummy_loop(
                clock,
                shape,
                outcome.passes,
                window_segment(dummy.as_ref(), region, shape, bytes_per_call),
            ),
            LoadKernels::Random { dummy, .. } => dummy_loop(
                clock,
                shape,
                outcome.passes,
                chain_segment(dummy.as_ref(), region, shape, bytes_per_pass),
            ),
        };

        Ok(WorkerResult::from_loops(
            outcome,
            elapsed_dummy_ticks,
            bytes_per_pass,
            counters,
            config.min_elapsed_ticks,
        ))
    }

    fn pattern_name(&self) -> &'static str {
        match self.kernels {
            LoadKernels::Sequential { .. } => "sequential",
            LoadKernels::Random { .. } => "random",
        }
    }
}

fn bytes_per_call(config: &crate::config::BenchmarkConfig) -> u64 {
    config
        .load
        .bytes_per_pass
        .saturating_mul(config.load.passes_per_call)
}

/// Segment over a moving window; covered once the window has wrapped
fn window_segment<'a>(
    kernel: &'a dyn SequentialKernel,
    region: &'a MemoryRegion,
    shape: LoopShape,
    bytes_per_call: usize,
) -> impl FnMut() -> bool + 'a {
    let mut window = SequentialWindow::new(region.len(), bytes_per_call);
    let mut lapped = false;

    move || {
        for _ in 0..shape.calls_per_segment {
            kernel.touch(region, window.start(), window.end());
            lapped |= window.advance();
        }
        lapped
    }
}

/// Segment along a chain; covered once the touched bytes reach the region length
fn chain_segment<'a>(
    kernel: &'a dyn RandomKernel,
    region: &'a MemoryRegion,
    shape: LoopShape,
    bytes_per_pass: u64,
) -> impl FnMut() -> bool + 'a {
    let region_len = region.len() as u64;
    let bytes_per_call = shape.passes_per_call.saturating_mul(bytes_per_pass) as usize;
    let bytes_per_segment = shape.passes_per_segment().saturating_mul(bytes_per_pass);
    let mut current = 0usize;
    let mut touched = 0u64;

    move || {
        for _ in 0..shape.calls_per_segment {
            current = kernel.step(region, current, bytes_per_call);
        }
        touched = touched.saturating_add(bytes_per_segment);
        touched >= region_len
    }
}

impl Worker for LoadWorker {
    fn run(&self) -> Result<()> {
        self.base.execute(self.kind(), || self.measure())
    }

    fn get_result(&self) -> WorkerResult {
        self.base.get_result()
    }

    fn kind(&self) -> &'static str {
        "load"
    }
}
