//! Unloaded access latency
//!
//! A [`LatencyWorker`] follows a pointer chain through its region. Every access
//! depends on the value returned by the previous one, so neither out-of-order
//! execution nor prefetching can overlap them and the adjusted time per pass is
//! the access latency.
//!
//! The sequential order times `unroll` single-hop calls per segment. The random
//! order times one call per segment that itself performs
//! `random_passes_per_call` hops through the windowed random chain.

use super::measure::{dummy_loop, termination_for, timed_loop, LoopShape};
use super::{MemoryWorker, Worker, WorkerResult};
use crate::error::WorkerError;
use crate::kernel::{builtin, AccessPattern, ChaseCursor, ChaseKernel, KernelPair};
use crate::util::region::MemoryRegion;
use crate::Result;
use std::sync::Arc;

/// Pointer-chase latency worker
pub struct LatencyWorker {
    base: MemoryWorker,
    order: AccessPattern,
    measured: Arc<dyn ChaseKernel>,
    dummy: Arc<dyn ChaseKernel>,
}

impl LatencyWorker {
    /// Build a latency worker
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::KernelMismatch`] unless `kernels` is a chase pair,
    /// and [`WorkerError::InvalidRegion`] when the region cannot hold one pass.
    pub fn new(base: MemoryWorker, kernels: KernelPair) -> std::result::Result<Self, WorkerError> {
        let (order, measured, dummy) = match kernels {
            KernelPair::Chase { order, measured, dummy } => (order, measured, dummy),
            other => {
                return Err(WorkerError::KernelMismatch {
                    worker: "LatencyWorker",
                    shape: other.shape(),
                })
            }
        };

        let len = base.region().len();
        let bytes_per_pass = base.config().latency.bytes_per_pass as usize;
        if bytes_per_pass == 0 || len < bytes_per_pass {
            return Err(WorkerError::InvalidRegion { len, bytes_per_pass });
        }

        Ok(Self {
            base,
            order,
            measured,
            dummy,
        })
    }

    pub fn base(&self) -> &MemoryWorker {
        &self.base
    }

    pub fn order(&self) -> AccessPattern {
        self.order
    }

    fn shape(&self) -> LoopShape {
        let latency = &self.base.config().latency;
        match self.order {
            AccessPattern::Sequential => LoopShape {
                calls_per_segment: latency.unroll,
                passes_per_call: 1,
            },
            AccessPattern::Random => LoopShape {
                calls_per_segment: 1,
                passes_per_call: latency.random_passes_per_call,
            },
        }
    }

    fn measure(&self) -> Result<WorkerResult> {
        let base = &self.base;
        let config = base.config();
        let region = base.region();
        let clock = base.timing().clock.as_ref();
        let bytes_per_pass = config.latency.bytes_per_pass;

        // Fails the run before anything is measured
        let mut handles = base.counters().open(&config.counters.latency_events())?;

        builtin::prime(region, config.latency.prime_passes);

        let termination = termination_for(region.len(), config, base.timing());
        let shape = self.shape();
        tracing::debug!(
            cpu = base.cpu(),
            order = %self.order,
            ?termination,
            ?shape,
            region_bytes = region.len(),
            "starting latency measurement"
        );

        handles.reset();
        handles.enable();
        let outcome = timed_loop(
            clock,
            termination,
            shape,
            chase_segment(self.measured.as_ref(), region, self.order, shape, bytes_per_pass),
        );
        handles.disable();
        let counters = handles.read();
        handles.close();

        let elapsed_dummy_ticks = dummy_loop(
            clock,
            shape,
            outcome.passes,
            chase_segment(self.dummy.as_ref(), region, self.order, shape, bytes_per_pass),
        );

        Ok(WorkerResult::from_loops(
            outcome,
            elapsed_dummy_ticks,
            bytes_per_pass,
            counters,
            config.min_elapsed_ticks,
        ))
    }
}

/// One timed segment of chase calls
///
/// Coverage is a full lap back to the chain head for the sequential order and
/// cumulative touched bytes for the random order.
fn chase_segment<'a>(
    kernel: &'a dyn ChaseKernel,
    region: &'a MemoryRegion,
    order: AccessPattern,
    shape: LoopShape,
    bytes_per_pass: u64,
) -> impl FnMut() -> bool + 'a {
    let region_len = region.len() as u64;
    let bytes_per_segment = shape.passes_per_segment().saturating_mul(bytes_per_pass);
    let mut current = 0usize;
    let mut cursor = ChaseCursor::default();
    let mut lapped = false;
    let mut touched = 0u64;

    move || {
        for _ in 0..shape.calls_per_segment {
            current = kernel.chase(region, current, &mut cursor);
            lapped |= current == 0;
        }
        touched = touched.saturating_add(bytes_per_segment);
        match order {
            AccessPattern::Sequential => lapped,
            AccessPattern::Random => touched >= region_len,
        }
    }
}

impl Worker for LatencyWorker {
    fn run(&self) -> Result<()> {
        self.base.execute(self.kind(), || self.measure())
    }

    fn get_result(&self) -> WorkerResult {
        self.base.get_result()
    }

    fn kind(&self) -> &'static str {
        "latency"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchmarkConfig;
    use crate::counters::mock::{CounterCall, MockBackend};
    use crate::counters::CounterEvent;
    use crate::error::CounterError;
    use crate::kernel::builtin::{ChaseDummy, SequentialChase, WindowedRandomChase, LINE_BYTES};
    use crate::util::fast_time::{StepClock, Timing};
    use crate::util::region::RegionBuffer;
    use crate::worker::affinity::{ControlCall, CpuControl, RecordingCpuControl};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    fn step_timing() -> Timing {
        Timing::new(Arc::new(StepClock::new(1)), 1_000)
    }

    fn worker_with(
        region: MemoryRegion,
        config: BenchmarkConfig,
        kernels: KernelPair,
        counters: MockBackend,
    ) -> LatencyWorker {
        let base = MemoryWorker::new(region, 0, Arc::new(config), step_timing())
            .with_counters(Arc::new(counters))
            .with_cpu_control(Arc::new(RecordingCpuControl::new()));
        LatencyWorker::new(base, kernels).unwrap()
    }

    fn sequential_pair() -> KernelPair {
        KernelPair::chase(AccessPattern::Sequential, SequentialChase, ChaseDummy::Sequential)
    }

    #[test]
    fn test_rejects_non_chase_kernels() {
        let region = RegionBuffer::allocate(4096).unwrap();
        let base = MemoryWorker::new(region, 0, Arc::new(BenchmarkConfig::default()), step_timing());
        let pair = KernelPair::sequential(builtin::ForwardRead, builtin::SequentialDummy);
        let err = LatencyWorker::new(base, pair).err().unwrap();
        assert!(matches!(
            err,
            WorkerError::KernelMismatch { worker: "LatencyWorker", shape: "sequential" }
        ));
    }

    #[test]
    fn test_duration_run_publishes_calibrated_result() {
        let region = RegionBuffer::allocate(64 * 1024).unwrap();
        builtin::build_sequential_chain(&region).unwrap();
        let counters = MockBackend::new();
        counters.set_count(CounterEvent::LocalDramAccess, 1234);
        counters.set_count(CounterEvent::WritePendingQueueOccupancy, 99);

        let config = BenchmarkConfig {
            duration_ms: 2,
            ..Default::default()
        };
        let worker = worker_with(region, config, sequential_pair(), counters.clone());
        worker.run().unwrap();

        let result = worker.get_result();
        assert!(result.completed);
        // One tick per segment against a 2000 tick budget
        assert_eq!(result.elapsed_ticks, 2_000);
        assert_eq!(result.passes, 2_000 * 256);
        assert_eq!(result.bytes_per_pass, 64);
        assert_eq!(
            result.adjusted_ticks,
            result.elapsed_ticks as i64 - result.elapsed_dummy_ticks as i64
        );
        assert_eq!(result.counters.get(CounterEvent::LocalDramAccess), 1234);
        // Occupancy events are not requested for latency runs
        assert_eq!(result.counters.get(CounterEvent::WritePendingQueueOccupancy), 0);
        assert_eq!(counters.opened_specs().len(), 4);
    }

    #[test]
    fn test_large_region_runs_one_full_lap() {
        let lines = 64;
        let region = RegionBuffer::allocate(lines * LINE_BYTES).unwrap();
        builtin::build_sequential_chain(&region).unwrap();

        let mut config = BenchmarkConfig {
            large_region_threshold: (lines * LINE_BYTES) as u64,
            ..Default::default()
        };
        config.latency.unroll = 16;
        let worker = worker_with(region, config, sequential_pair(), MockBackend::new());
        worker.run().unwrap();

        // The chain returns to its head after exactly one hop per line
        let result = worker.get_result();
        assert!(result.completed);
        assert_eq!(result.passes, lines as u64);
    }

    #[test]
    fn test_large_region_lap_detected_mid_segment() {
        let lines = 40;
        let region = RegionBuffer::allocate(lines * LINE_BYTES).unwrap();
        builtin::build_sequential_chain(&region).unwrap();

        let mut config = BenchmarkConfig {
            large_region_threshold: 1,
            ..Default::default()
        };
        config.latency.unroll = 16;
        let worker = worker_with(region, config, sequential_pair(), MockBackend::new());
        worker.run().unwrap();

        // The lap completes inside the third segment
        assert_eq!(worker.get_result().passes, 48);
    }

    #[test]
    fn test_random_full_touch_counts_bytes() {
        let len = 256 * 1024;
        let window = 64 * 1024;
        let hops = 512u64;
        let region = RegionBuffer::allocate(len).unwrap();
        builtin::build_random_chain(&region, window, 11).unwrap();

        let mut config = BenchmarkConfig {
            large_region_threshold: len as u64,
            ..Default::default()
        };
        config.latency.random_passes_per_call = hops;
        let kernels = KernelPair::chase(
            AccessPattern::Random,
            WindowedRandomChase::new(hops as usize, window),
            ChaseDummy::Windowed {
                hops: hops as usize,
                window_bytes: window,
            },
        );
        let worker = worker_with(region, config, kernels, MockBackend::new());
        worker.run().unwrap();

        let result = worker.get_result();
        assert_eq!(result.passes, (len / LINE_BYTES) as u64);
        assert!(result.total_bytes() >= len as u64);
    }

    #[test]
    fn test_counters_bracket_only_measured_loop() {
        let region = RegionBuffer::allocate(16 * 1024).unwrap();
        builtin::build_sequential_chain(&region).unwrap();
        let counters = MockBackend::new();

        let dummy_entry: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&dummy_entry);
        let measured_calls = Arc::new(AtomicU64::new(0));
        let calls = Arc::clone(&measured_calls);

        let kernels = KernelPair::chase(
            AccessPattern::Sequential,
            move |r: &MemoryRegion, cur: usize, _: &mut ChaseCursor| {
                calls.fetch_add(1, Ordering::Relaxed);
                r.load(cur) as usize
            },
            move |_: &MemoryRegion, cur: usize, _: &mut ChaseCursor| {
                seen.lock().unwrap().get_or_insert_with(Instant::now);
                cur
            },
        );

        let config = BenchmarkConfig {
            duration_ms: 1,
            ..Default::default()
        };
        let worker = worker_with(region, config, kernels, counters.clone());
        worker.run().unwrap();

        assert_eq!(
            counters.calls(),
            vec![
                CounterCall::Open,
                CounterCall::Reset,
                CounterCall::Enable,
                CounterCall::Disable,
                CounterCall::Read,
                CounterCall::Close,
            ]
        );
        let closed = counters.call_time(CounterCall::Close).unwrap();
        let dummy_started = dummy_entry.lock().unwrap().unwrap();
        assert!(dummy_started >= closed);
        assert_eq!(measured_calls.load(Ordering::Relaxed), worker.get_result().passes);
    }

    #[test]
    fn test_counter_open_failure_aborts_without_result() {
        let region = RegionBuffer::allocate(4096).unwrap();
        builtin::build_sequential_chain(&region).unwrap();
        let control = Arc::new(RecordingCpuControl::new());
        let control_dyn: Arc<dyn CpuControl> = control.clone();
        let base = MemoryWorker::new(region, 1, Arc::new(BenchmarkConfig::default()), step_timing())
            .with_counters(Arc::new(MockBackend::failing()))
            .with_cpu_control(control_dyn);
        let worker = LatencyWorker::new(base, sequential_pair()).unwrap();

        let err = worker.run().unwrap_err();
        assert!(matches!(err.downcast_ref::<CounterError>(), Some(CounterError::Open { .. })));
        assert!(!worker.get_result().completed);
        assert_eq!(worker.get_result().passes, 0);
        // Pinning and priority are still released on the abort path
        assert!(control.calls().contains(&ControlCall::Unpin));
        assert!(matches!(control.calls().last(), Some(ControlCall::Revert(_))));
    }

    #[test]
    fn test_second_run_is_rejected() {
        let region = RegionBuffer::allocate(4096).unwrap();
        builtin::build_sequential_chain(&region).unwrap();
        let config = BenchmarkConfig {
            duration_ms: 1,
            ..Default::default()
        };
        let worker = worker_with(region, config, sequential_pair(), MockBackend::new());
        worker.run().unwrap();
        let first = worker.get_result();

        let err = worker.run().unwrap_err();
        assert!(matches!(err.downcast_ref::<WorkerError>(), Some(WorkerError::AlreadyRun)));
        assert_eq!(worker.get_result(), first);
    }
}
