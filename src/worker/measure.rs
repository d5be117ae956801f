//! Calibrated timing loops
//!
//! Both worker kinds run the same two loops:
//!
//! 1. The measured loop executes timed segments of `calls_per_segment` kernel
//!    calls until the [`Termination`] condition holds, counting passes.
//! 2. The dummy loop executes the same segment shape with the no-op kernel
//!    until it has counted at least as many passes.
//!
//! [`calibrate`] then subtracts the dummy time and flags results whose signal is
//! too weak to trust.

use crate::config::BenchmarkConfig;
use crate::util::fast_time::{TickSource, Timing};

/// Overhead-adjusted timing and its quality flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub adjusted_ticks: i64,
    pub warning: bool,
}

/// Subtract the dummy loop time and judge the result
///
/// The warning is raised when the dummy took at least as long as the measured
/// loop, when the measured loop was shorter than `min_elapsed_ticks`, or when
/// overhead ate more than half of the measured time.
pub fn calibrate(elapsed_ticks: u64, elapsed_dummy_ticks: u64, min_elapsed_ticks: u64) -> Calibration {
    let adjusted = elapsed_ticks as i128 - elapsed_dummy_ticks as i128;
    let adjusted_ticks = adjusted.clamp(i64::MIN as i128, i64::MAX as i128) as i64;

    let warning = elapsed_dummy_ticks >= elapsed_ticks
        || elapsed_ticks < min_elapsed_ticks
        || adjusted * 2 < elapsed_ticks as i128;

    Calibration {
        adjusted_ticks,
        warning,
    }
}

/// When the measured loop stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stop once accumulated loop time reaches the tick budget
    Duration { target_ticks: u64 },
    /// Stop once every byte of the region has been visited
    FullTouch,
}

/// Select the termination policy for a region
///
/// Regions at or above `large_region_threshold` are measured until fully
/// touched; smaller ones run for `duration_ms`.
pub fn termination_for(region_len: usize, config: &BenchmarkConfig, timing: &Timing) -> Termination {
    if region_len as u64 >= config.large_region_threshold {
        Termination::FullTouch
    } else {
        Termination::Duration {
            target_ticks: timing.target_ticks(config.duration_ms),
        }
    }
}

/// Number of kernel calls per timed segment and passes each call represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopShape {
    pub calls_per_segment: u64,
    pub passes_per_call: u64,
}

impl LoopShape {
    pub fn passes_per_segment(&self) -> u64 {
        self.calls_per_segment.saturating_mul(self.passes_per_call).max(1)
    }
}

/// Ticks and passes accumulated by a loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopOutcome {
    pub elapsed_ticks: u64,
    pub passes: u64,
}

/// Run the measured loop
///
/// `segment` executes one segment of kernel calls and reports whether the
/// region has been fully covered so far. Only the segment itself is timed.
#[inline(never)]
pub fn timed_loop<F>(clock: &dyn TickSource, termination: Termination, shape: LoopShape, mut segment: F) -> LoopOutcome
where
    F: FnMut() -> bool,
{
    let step = shape.passes_per_segment();
    let mut outcome = LoopOutcome::default();

    loop {
        let start = clock.start_ticks();
        let covered = segment();
        let stop = clock.stop_ticks();

        outcome.elapsed_ticks = outcome.elapsed_ticks.saturating_add(stop.saturating_sub(start));
        outcome.passes = outcome.passes.saturating_add(step);

        let done = match termination {
            Termination::Duration { target_ticks } => outcome.elapsed_ticks >= target_ticks,
            Termination::FullTouch => covered,
        };
        if done {
            return outcome;
        }
    }
}

/// Run the dummy loop for at least `passes` passes and return its ticks
///
/// `segment` is the dummy counterpart of the measured segment. Its coverage
/// result is computed the same way and ignored.
#[inline(never)]
pub fn dummy_loop<F>(clock: &dyn TickSource, shape: LoopShape, passes: u64, mut segment: F) -> u64
where
    F: FnMut() -> bool,
{
    let step = shape.passes_per_segment();
    let mut elapsed_ticks = 0u64;
    let mut counted = 0u64;

    while counted < passes {
        let start = clock.start_ticks();
        std::hint::black_box(segment());
        let stop = clock.stop_ticks();

        elapsed_ticks = elapsed_ticks.saturating_add(stop.saturating_sub(start));
        counted = counted.saturating_add(step);
    }
    elapsed_ticks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::fast_time::StepClock;
    use std::sync::Arc;

    const MIN_TICKS: u64 = 10_000;

    #[test]
    fn test_adjusted_is_exact_difference() {
        let c = calibrate(1_000_000, 123_456, MIN_TICKS);
        assert_eq!(c.adjusted_ticks, 1_000_000 - 123_456);
        assert!(!c.warning);
    }

    #[test]
    fn test_warning_when_dummy_not_faster() {
        let c = calibrate(50_000, 50_000, MIN_TICKS);
        assert_eq!(c.adjusted_ticks, 0);
        assert!(c.warning);

        let c = calibrate(50_000, 60_000, MIN_TICKS);
        assert_eq!(c.adjusted_ticks, -10_000);
        assert!(c.warning);
    }

    #[test]
    fn test_warning_when_elapsed_below_minimum() {
        // Dummy is negligible, so only the minimum-ticks rule applies
        let c = calibrate(9_999, 1, MIN_TICKS);
        assert_eq!(c.adjusted_ticks, 9_998);
        assert!(c.warning);

        let c = calibrate(10_000, 1, MIN_TICKS);
        assert!(!c.warning);
    }

    #[test]
    fn test_warning_when_overhead_dominates() {
        let c = calibrate(10_000, 9_500, MIN_TICKS);
        assert_eq!(c.adjusted_ticks, 500);
        assert!(c.warning);

        // Exactly half is still acceptable
        let c = calibrate(20_000, 10_000, MIN_TICKS);
        assert_eq!(c.adjusted_ticks, 10_000);
        assert!(!c.warning);

        let c = calibrate(20_000, 10_001, MIN_TICKS);
        assert!(c.warning);
    }

    #[test]
    fn test_termination_switches_at_threshold() {
        let timing = Timing::new(Arc::new(StepClock::new(1)), 1_000);
        let config = BenchmarkConfig {
            duration_ms: 5,
            large_region_threshold: 64 * 1024,
            ..Default::default()
        };

        assert_eq!(
            termination_for(64 * 1024 - 64, &config, &timing),
            Termination::Duration { target_ticks: 5_000 }
        );
        assert_eq!(termination_for(64 * 1024, &config, &timing), Termination::FullTouch);
        assert_eq!(termination_for(1024 * 1024, &config, &timing), Termination::FullTouch);
    }

    #[test]
    fn test_timed_loop_stops_on_budget() {
        // Every read advances 10 ticks, so each segment measures 10
        let clock = StepClock::new(10);
        let shape = LoopShape {
            calls_per_segment: 4,
            passes_per_call: 2,
        };
        let mut segments = 0;
        let outcome = timed_loop(&clock, Termination::Duration { target_ticks: 100 }, shape, || {
            segments += 1;
            true
        });
        assert_eq!(segments, 10);
        assert_eq!(outcome.elapsed_ticks, 100);
        assert_eq!(outcome.passes, 80);
    }

    #[test]
    fn test_full_touch_ignores_time_budget() {
        let clock = StepClock::new(1_000_000);
        let shape = LoopShape {
            calls_per_segment: 1,
            passes_per_call: 1,
        };
        let mut segments = 0;
        let outcome = timed_loop(&clock, Termination::FullTouch, shape, || {
            segments += 1;
            segments == 7
        });
        assert_eq!(outcome.passes, 7);
        assert_eq!(outcome.elapsed_ticks, 7_000_000);
    }

    #[test]
    fn test_dummy_loop_matches_pass_count() {
        let clock = StepClock::new(3);
        let shape = LoopShape {
            calls_per_segment: 256,
            passes_per_call: 1,
        };
        let mut segments = 0;
        let ticks = dummy_loop(&clock, shape, 256 * 5, || {
            segments += 1;
            false
        });
        assert_eq!(segments, 5);
        assert_eq!(ticks, 15);

        assert_eq!(dummy_loop(&clock, shape, 0, || true), 0);
    }
}
