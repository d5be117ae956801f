//! Access-pattern kernels
//!
//! A kernel is the innermost routine a worker times. Kernels come in three
//! shapes, each with its own capability trait:
//!
//! - **Sequential**: touches the half-open byte range `[start, end)`
//! - **Random**: touches `bytes` worth of a chase chain starting at `current`
//!   and returns the next offset
//! - **Chase**: one dependent pointer-chase step (or a fixed run of them) that
//!   also threads a [`ChaseCursor`] across calls, so a chain can be walked in an
//!   exhaustive pseudo-random order
//!
//! Every measured kernel is paired with a dummy of the same shape that keeps the
//! loop structure and offset arithmetic but has no memory effect. Workers time
//! both and subtract. [`KernelPair`] carries the pair and its shape tag; workers
//! match on the tag once, outside the timed loop.
//!
//! Closures with the matching signature implement the traits, which is how the
//! tests build instrumented kernels.

pub mod builtin;

use crate::util::region::MemoryRegion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Touches a contiguous byte range of a region
pub trait SequentialKernel: Send + Sync {
    fn touch(&self, region: &MemoryRegion, start: usize, end: usize);
}

impl<F> SequentialKernel for F
where
    F: Fn(&MemoryRegion, usize, usize) + Send + Sync,
{
    #[inline(always)]
    fn touch(&self, region: &MemoryRegion, start: usize, end: usize) {
        self(region, start, end)
    }
}

/// Follows a chain for `bytes` worth of accesses and returns the next offset
pub trait RandomKernel: Send + Sync {
    fn step(&self, region: &MemoryRegion, current: usize, bytes: usize) -> usize;
}

impl<F> RandomKernel for F
where
    F: Fn(&MemoryRegion, usize, usize) -> usize + Send + Sync,
{
    #[inline(always)]
    fn step(&self, region: &MemoryRegion, current: usize, bytes: usize) -> usize {
        self(region, current, bytes)
    }
}

/// Base/offset accumulator threaded through chase calls
///
/// `base` is the byte offset of the chain window being walked and `offset`
/// counts the hops taken inside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaseCursor {
    pub base: usize,
    pub offset: usize,
}

/// Dependent pointer chase that may advance a [`ChaseCursor`]
pub trait ChaseKernel: Send + Sync {
    fn chase(&self, region: &MemoryRegion, current: usize, cursor: &mut ChaseCursor) -> usize;
}

impl<F> ChaseKernel for F
where
    F: Fn(&MemoryRegion, usize, &mut ChaseCursor) -> usize + Send + Sync,
{
    #[inline(always)]
    fn chase(&self, region: &MemoryRegion, current: usize, cursor: &mut ChaseCursor) -> usize {
        self(region, current, cursor)
    }
}

/// Order in which a region is visited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPattern {
    Sequential,
    Random,
}

impl fmt::Display for AccessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessPattern::Sequential => write!(f, "sequential"),
            AccessPattern::Random => write!(f, "random"),
        }
    }
}

/// Measured kernel and its dummy, tagged by shape
#[derive(Clone)]
pub enum KernelPair {
    Sequential {
        measured: Arc<dyn SequentialKernel>,
        dummy: Arc<dyn SequentialKernel>,
    },
    Random {
        measured: Arc<dyn RandomKernel>,
        dummy: Arc<dyn RandomKernel>,
    },
    Chase {
        order: AccessPattern,
        measured: Arc<dyn ChaseKernel>,
        dummy: Arc<dyn ChaseKernel>,
    },
}

impl KernelPair {
    pub fn sequential(
        measured: impl SequentialKernel + 'static,
        dummy: impl SequentialKernel + 'static,
    ) -> Self {
        KernelPair::Sequential {
            measured: Arc::new(measured),
            dummy: Arc::new(dummy),
        }
    }

    pub fn random(measured: impl RandomKernel + 'static, dummy: impl RandomKernel + 'static) -> Self {
        KernelPair::Random {
            measured: Arc::new(measured),
            dummy: Arc::new(dummy),
        }
    }

    pub fn chase(
        order: AccessPattern,
        measured: impl ChaseKernel + 'static,
        dummy: impl ChaseKernel + 'static,
    ) -> Self {
        KernelPair::Chase {
            order,
            measured: Arc::new(measured),
            dummy: Arc::new(dummy),
        }
    }

    /// Name of the shape, for diagnostics
    pub fn shape(&self) -> &'static str {
        match self {
            KernelPair::Sequential { .. } => "sequential",
            KernelPair::Random { .. } => "random",
            KernelPair::Chase { .. } => "chase",
        }
    }

    /// Visiting order implied by the pair
    pub fn pattern(&self) -> AccessPattern {
        match self {
            KernelPair::Sequential { .. } => AccessPattern::Sequential,
            KernelPair::Random { .. } => AccessPattern::Random,
            KernelPair::Chase { order, .. } => *order,
        }
    }
}

impl fmt::Debug for KernelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelPair")
            .field("shape", &self.shape())
            .field("pattern", &self.pattern())
            .finish()
    }
}

/// Fixed-size window moving through a region with wraparound
///
/// After `k` advances the window starts at `(k * bytes) % len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequentialWindow {
    start: usize,
    len: usize,
    bytes: usize,
}

impl SequentialWindow {
    /// `len` must be a non-zero multiple of `bytes`
    pub fn new(len: usize, bytes: usize) -> Self {
        debug_assert!(bytes > 0 && len >= bytes && len % bytes == 0);
        Self { start: 0, len, bytes }
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start + self.bytes
    }

    /// Move to the next window; true when it wrapped back to the region start
    #[inline(always)]
    pub fn advance(&mut self) -> bool {
        self.start = (self.start + self.bytes) % self.len;
        self.start == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::region::RegionBuffer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_window_wraparound() {
        let len = 64 * 1024;
        let bytes = 4096;
        let mut window = SequentialWindow::new(len, bytes);
        for k in 1..=40usize {
            let wrapped = window.advance();
            assert_eq!(window.start(), (k * bytes) % len);
            assert_eq!(window.end(), window.start() + bytes);
            assert_eq!(wrapped, k % 16 == 0);
        }
    }

    #[test]
    fn test_single_window_region_wraps_every_pass() {
        let mut window = SequentialWindow::new(4096, 4096);
        assert!(window.advance());
        assert!(window.advance());
        assert_eq!(window.start(), 0);
    }

    #[test]
    fn test_closures_implement_kernels() {
        let region = RegionBuffer::allocate(1024).unwrap();
        let touched = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&touched);
        let pair = KernelPair::sequential(
            move |_: &MemoryRegion, start: usize, end: usize| {
                seen.fetch_add(end - start, Ordering::Relaxed);
            },
            |_: &MemoryRegion, _: usize, _: usize| {},
        );
        if let KernelPair::Sequential { measured, .. } = &pair {
            measured.touch(&region, 0, 128);
        }
        assert_eq!(touched.load(Ordering::Relaxed), 128);
        assert_eq!(pair.shape(), "sequential");
        assert_eq!(pair.pattern(), AccessPattern::Sequential);
    }

    #[test]
    fn test_chase_pair_reports_order() {
        let pair = KernelPair::chase(
            AccessPattern::Random,
            |r: &MemoryRegion, cur: usize, _: &mut ChaseCursor| r.load(cur) as usize,
            |_: &MemoryRegion, cur: usize, _: &mut ChaseCursor| cur,
        );
        assert_eq!(pair.shape(), "chase");
        assert_eq!(pair.pattern(), AccessPattern::Random);
    }
}
