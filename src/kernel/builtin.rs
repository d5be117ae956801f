//! Reference kernels, dummies and chain builders
//!
//! Random and chase kernels walk a chain stored in the region itself: the first
//! word of every cache line holds the byte offset of the next line to visit.
//! [`build_sequential_chain`], [`build_random_chain`] and [`build_region_chain`]
//! lay those chains out.

use super::{ChaseCursor, ChaseKernel, RandomKernel, SequentialKernel};
use crate::util::region::{MemoryRegion, WORD_BYTES};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::hint::black_box;

/// Bytes per chained cache line
pub const LINE_BYTES: usize = 64;

/// Sequential 64-bit reads over `[start, end)`
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardRead;

impl SequentialKernel for ForwardRead {
    #[inline(always)]
    fn touch(&self, region: &MemoryRegion, start: usize, end: usize) {
        let words = &region.words()[start / WORD_BYTES..end / WORD_BYTES];
        let mut acc = 0u64;
        for word in words {
            acc = acc.wrapping_add(word.load(std::sync::atomic::Ordering::Relaxed));
        }
        black_box(acc);
    }
}

/// Sequential 64-bit writes over `[start, end)`
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardWrite;

impl SequentialKernel for ForwardWrite {
    #[inline(always)]
    fn touch(&self, region: &MemoryRegion, start: usize, end: usize) {
        let words = &region.words()[start / WORD_BYTES..end / WORD_BYTES];
        let value = black_box(0xa5a5_a5a5_a5a5_a5a5u64);
        for word in words {
            word.store(value, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

/// Same loop as the sequential kernels without touching memory
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialDummy;

impl SequentialKernel for SequentialDummy {
    #[inline(always)]
    fn touch(&self, _region: &MemoryRegion, start: usize, end: usize) {
        let mut acc = 0usize;
        for offset in (start..end).step_by(WORD_BYTES) {
            acc = acc.wrapping_add(black_box(offset));
        }
        black_box(acc);
    }
}

#[inline(always)]
fn hops_for(bytes: usize) -> usize {
    (bytes / LINE_BYTES).max(1)
}

/// Dependent reads along a chain, one line per hop
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomRead;

impl RandomKernel for RandomRead {
    #[inline(always)]
    fn step(&self, region: &MemoryRegion, current: usize, bytes: usize) -> usize {
        let mut next = current;
        for _ in 0..hops_for(bytes) {
            next = region.load(next) as usize;
        }
        next
    }
}

/// Dependent reads along a chain, writing into the second word of each line
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomWrite;

impl RandomKernel for RandomWrite {
    #[inline(always)]
    fn step(&self, region: &MemoryRegion, current: usize, bytes: usize) -> usize {
        let mut next = current;
        for _ in 0..hops_for(bytes) {
            let line = next;
            next = region.load(line) as usize;
            region.store(line + WORD_BYTES, next as u64);
        }
        next
    }
}

/// Same loop as the random kernels without the loads
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomDummy;

impl RandomKernel for RandomDummy {
    #[inline(always)]
    fn step(&self, _region: &MemoryRegion, current: usize, bytes: usize) -> usize {
        let mut next = current;
        for _ in 0..hops_for(bytes) {
            next = black_box(next);
        }
        next
    }
}

/// One dependent hop along a sequential chain
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialChase;

impl ChaseKernel for SequentialChase {
    #[inline(always)]
    fn chase(&self, region: &MemoryRegion, current: usize, _cursor: &mut ChaseCursor) -> usize {
        region.load(current) as usize
    }
}

/// Fixed run of dependent hops through windowed random cycles
///
/// Each window of the region holds its own cycle that starts and ends at the
/// window's first line. The cursor tracks the window (`base`) and the hops taken
/// in it (`offset`); once every line of the window has been visited the walk
/// moves on to the next window, so the whole region is eventually covered.
#[derive(Debug, Clone, Copy)]
pub struct WindowedRandomChase {
    hops: usize,
    window_bytes: usize,
}

impl WindowedRandomChase {
    pub fn new(hops: usize, window_bytes: usize) -> Self {
        Self { hops, window_bytes }
    }
}

#[inline(always)]
fn advance_cursor(cursor: &mut ChaseCursor, window_bytes: usize, region_len: usize) -> Option<usize> {
    cursor.offset += 1;
    let window_len = window_bytes.min(region_len - cursor.base);
    if cursor.offset * LINE_BYTES >= window_len {
        cursor.base += window_bytes;
        if cursor.base >= region_len {
            cursor.base = 0;
        }
        cursor.offset = 0;
        return Some(cursor.base);
    }
    None
}

impl ChaseKernel for WindowedRandomChase {
    #[inline(always)]
    fn chase(&self, region: &MemoryRegion, current: usize, cursor: &mut ChaseCursor) -> usize {
        let len = region.len();
        let mut next = current;
        for _ in 0..self.hops {
            next = region.load(next) as usize;
            if let Some(base) = advance_cursor(cursor, self.window_bytes, len) {
                next = base;
            }
        }
        next
    }
}

/// Same loop shape as the chase kernels without the loads
#[derive(Debug, Clone, Copy)]
pub enum ChaseDummy {
    /// Mirrors [`SequentialChase`]
    Sequential,
    /// Mirrors [`WindowedRandomChase`]
    Windowed { hops: usize, window_bytes: usize },
}

impl ChaseKernel for ChaseDummy {
    #[inline(always)]
    fn chase(&self, region: &MemoryRegion, current: usize, cursor: &mut ChaseCursor) -> usize {
        match *self {
            ChaseDummy::Sequential => black_box(current),
            ChaseDummy::Windowed { hops, window_bytes } => {
                let len = region.len();
                let mut next = current;
                for _ in 0..hops {
                    next = black_box(next);
                    if let Some(base) = advance_cursor(cursor, window_bytes, len) {
                        next = base;
                    }
                }
                next
            }
        }
    }
}

fn check_chain_region(region: &MemoryRegion) -> crate::Result<usize> {
    if region.is_empty() || region.len() % LINE_BYTES != 0 {
        anyhow::bail!(
            "chain region must be a non-zero multiple of {} bytes, got {}",
            LINE_BYTES,
            region.len()
        );
    }
    Ok(region.len() / LINE_BYTES)
}

/// Link every line to the following one, the last back to the first
pub fn build_sequential_chain(region: &MemoryRegion) -> crate::Result<()> {
    let lines = check_chain_region(region)?;
    for line in 0..lines {
        let next = (line + 1) % lines;
        region.store(line * LINE_BYTES, (next * LINE_BYTES) as u64);
    }
    Ok(())
}

/// Link the lines of each window into one shuffled cycle starting at its first line
pub fn build_random_chain(region: &MemoryRegion, window_bytes: usize, seed: u64) -> crate::Result<()> {
    check_chain_region(region)?;
    if window_bytes == 0 || window_bytes % LINE_BYTES != 0 {
        anyhow::bail!("chain window must be a non-zero multiple of {} bytes", LINE_BYTES);
    }

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut base = 0;
    while base < region.len() {
        let window_len = window_bytes.min(region.len() - base);
        let lines = window_len / LINE_BYTES;

        let mut order: Vec<usize> = (1..lines).collect();
        order.shuffle(&mut rng);

        let mut current = 0;
        for &line in &order {
            region.store(base + current * LINE_BYTES, (base + line * LINE_BYTES) as u64);
            current = line;
        }
        region.store(base + current * LINE_BYTES, base as u64);

        base += window_len;
    }
    Ok(())
}

/// Link every line of the region into one shuffled cycle starting at offset 0
///
/// Random load kernels carry no cursor, so their chain has to span the whole
/// region for a full lap to visit every line.
pub fn build_region_chain(region: &MemoryRegion, seed: u64) -> crate::Result<()> {
    build_random_chain(region, region.len().max(LINE_BYTES), seed)
}

/// Read the whole region `passes` times to settle caches, TLBs and page state
pub fn prime(region: &MemoryRegion, passes: u32) {
    for _ in 0..passes {
        ForwardRead.touch(region, 0, region.len());
    }
}
