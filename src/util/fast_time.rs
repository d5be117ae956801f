//! Tick sources for timed loops
//!
//! Workers time their measured and dummy loops with a [`TickSource`] and convert
//! the millisecond duration budget into ticks through [`Timing`]. Ticks are only
//! compared within one thread.

use anyhow::Context;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fast timestamp using direct clock_gettime with CLOCK_MONOTONIC
///
/// Resolution: Nanosecond
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FastInstant {
    nanos: u64,
}

impl FastInstant {
    /// Get the current time using CLOCK_MONOTONIC
    #[inline(always)]
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }

        let nanos = (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64);

        Self { nanos }
    }

    /// Nanoseconds since an unspecified epoch
    #[inline(always)]
    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Calculate duration since another FastInstant
    #[inline(always)]
    pub fn duration_since(&self, earlier: FastInstant) -> Duration {
        let nanos = self.nanos.saturating_sub(earlier.nanos);
        Duration::from_nanos(nanos)
    }

    /// Get elapsed time since this instant
    #[inline(always)]
    pub fn elapsed(&self) -> Duration {
        Self::now().duration_since(*self)
    }
}

/// Monotonic tick counter
///
/// `start_ticks` is read before a timed segment and `stop_ticks` after it, so
/// sources that need serialization can fence differently on each side.
pub trait TickSource: Send + Sync {
    fn start_ticks(&self) -> u64;
    fn stop_ticks(&self) -> u64;
}

/// CLOCK_MONOTONIC in nanoseconds
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Ticks per millisecond of this clock
    pub const TICKS_PER_MS: u64 = 1_000_000;
}

impl TickSource for MonotonicClock {
    #[inline(always)]
    fn start_ticks(&self) -> u64 {
        FastInstant::now().as_nanos()
    }

    #[inline(always)]
    fn stop_ticks(&self) -> u64 {
        FastInstant::now().as_nanos()
    }
}

/// Time stamp counter
///
/// `lfence; rdtsc` before the segment so earlier work drains first, `rdtscp;
/// lfence` after it so the read waits for the segment to retire.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Clone, Copy)]
pub struct TscClock;

#[cfg(target_arch = "x86_64")]
impl TickSource for TscClock {
    #[inline(always)]
    fn start_ticks(&self) -> u64 {
        // SAFETY: LFENCE and RDTSC are available on every x86_64 CPU
        unsafe {
            core::arch::x86_64::_mm_lfence();
            core::arch::x86_64::_rdtsc()
        }
    }

    #[inline(always)]
    fn stop_ticks(&self) -> u64 {
        let mut aux: u32 = 0;
        // SAFETY: RDTSCP is present on all x86_64 CPUs this tool targets
        unsafe {
            let ticks = core::arch::x86_64::__rdtscp(&mut aux);
            core::arch::x86_64::_mm_lfence();
            ticks
        }
    }
}

/// Deterministic tick source that advances a fixed step on every read
///
/// Used to drive termination logic without waiting on a wall clock.
#[derive(Debug, Default)]
pub struct StepClock {
    now: AtomicU64,
    step: u64,
}

impl StepClock {
    pub fn new(step: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            step,
        }
    }

    /// Number of reads so far
    pub fn reads(&self) -> u64 {
        if self.step == 0 {
            return 0;
        }
        self.now.load(Ordering::Relaxed) / self.step
    }
}

impl TickSource for StepClock {
    fn start_ticks(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::Relaxed)
    }

    fn stop_ticks(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::Relaxed)
    }
}

/// Tick source paired with its calibration constant
#[derive(Clone)]
pub struct Timing {
    pub clock: Arc<dyn TickSource>,
    pub ticks_per_ms: u64,
}

impl Timing {
    pub fn new(clock: Arc<dyn TickSource>, ticks_per_ms: u64) -> Self {
        Self { clock, ticks_per_ms }
    }

    /// Monotonic nanosecond clock
    pub fn monotonic() -> Self {
        Self::new(Arc::new(MonotonicClock), MonotonicClock::TICKS_PER_MS)
    }

    /// Build the configured tick source, calibrating it when needed
    pub fn from_config(config: &crate::config::TimerConfig) -> crate::Result<Self> {
        use crate::config::TimerSource;

        let clock: Arc<dyn TickSource> = match config.source {
            TimerSource::Monotonic => Arc::new(MonotonicClock),
            #[cfg(target_arch = "x86_64")]
            TimerSource::Tsc => Arc::new(TscClock),
            #[cfg(not(target_arch = "x86_64"))]
            TimerSource::Tsc => anyhow::bail!("TSC timer is only available on x86_64"),
        };

        let ticks_per_ms = match (config.ticks_per_ms, config.source) {
            (Some(ticks), _) => ticks,
            (None, TimerSource::Monotonic) => MonotonicClock::TICKS_PER_MS,
            (None, TimerSource::Tsc) => {
                calibrate_ticks_per_ms(clock.as_ref(), Duration::from_millis(config.calibration_ms))
                    .context("Failed to calibrate TSC")?
            }
        };

        tracing::debug!(source = ?config.source, ticks_per_ms, "timer ready");
        Ok(Self::new(clock, ticks_per_ms))
    }

    /// Tick budget for a millisecond duration
    pub fn target_ticks(&self, duration_ms: u64) -> u64 {
        self.ticks_per_ms.saturating_mul(duration_ms)
    }

    /// Convert ticks (possibly fractional) to nanoseconds
    pub fn ticks_to_ns(&self, ticks: f64) -> f64 {
        ticks * 1_000_000.0 / self.ticks_per_ms as f64
    }
}

impl std::fmt::Debug for Timing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timing")
            .field("ticks_per_ms", &self.ticks_per_ms)
            .finish_non_exhaustive()
    }
}

/// Measure how many ticks of `clock` elapse per millisecond of CLOCK_MONOTONIC
pub fn calibrate_ticks_per_ms(clock: &dyn TickSource, window: Duration) -> crate::Result<u64> {
    if window.is_zero() {
        anyhow::bail!("calibration window must be non-zero");
    }

    let wall_start = FastInstant::now();
    let tick_start = clock.start_ticks();
    while wall_start.elapsed() < window {
        std::hint::spin_loop();
    }
    let tick_stop = clock.stop_ticks();
    let wall = FastInstant::now().duration_since(wall_start);

    let ticks = tick_stop.saturating_sub(tick_start);
    let ticks_per_ms = (ticks as u128 * 1_000_000 / wall.as_nanos().max(1)) as u64;
    if ticks_per_ms == 0 {
        anyhow::bail!("tick source did not advance during {:?}", window);
    }
    Ok(ticks_per_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fast_instant_basic() {
        let start = FastInstant::now();
        thread::sleep(Duration::from_millis(10));
        let end = FastInstant::now();

        let elapsed = end.duration_since(start);

        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_monotonic_clock_ordering() {
        let clock = MonotonicClock;
        let t1 = clock.start_ticks();
        thread::sleep(Duration::from_millis(1));
        let t2 = clock.stop_ticks();
        assert!(t2 > t1);
    }

    #[test]
    fn test_step_clock() {
        let clock = StepClock::new(10);
        assert_eq!(clock.start_ticks(), 0);
        assert_eq!(clock.stop_ticks(), 10);
        assert_eq!(clock.start_ticks(), 20);
        assert_eq!(clock.reads(), 3);
    }

    #[test]
    fn test_target_ticks() {
        let timing = Timing::new(Arc::new(StepClock::new(1)), 1_000);
        assert_eq!(timing.target_ticks(250), 250_000);
        assert_eq!(timing.target_ticks(u64::MAX), u64::MAX);
        assert!((timing.ticks_to_ns(1_000.0) - 1_000_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_calibrate_monotonic() {
        let ticks = calibrate_ticks_per_ms(&MonotonicClock, Duration::from_millis(20)).unwrap();
        // Calibrating the reference against itself is close to exact
        assert!(ticks > 900_000 && ticks < 1_100_000, "ticks_per_ms = {}", ticks);
    }

    #[test]
    fn test_calibrate_rejects_zero_window() {
        assert!(calibrate_ticks_per_ms(&MonotonicClock, Duration::ZERO).is_err());
    }

    #[test]
    fn test_from_config_monotonic() {
        let timing = Timing::from_config(&crate::config::TimerConfig::default()).unwrap();
        assert_eq!(timing.ticks_per_ms, MonotonicClock::TICKS_PER_MS);
    }
}
