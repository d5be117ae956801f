//! Benchmark memory regions
//!
//! A [`RegionBuffer`] is a page-aligned, zero-initialized allocation owned by the
//! controller. Workers receive a [`MemoryRegion`], a view into that buffer
//! addressed by byte offsets. Offsets never leave the view as raw addresses.
//!
//! Words are accessed through `AtomicU64` with relaxed ordering. On the
//! platforms we target these compile to plain loads and stores, and they keep
//! concurrent workers over a shared buffer free of data races.

use anyhow::Context;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Size of one region word in bytes
pub const WORD_BYTES: usize = std::mem::size_of::<u64>();

/// Default buffer alignment (one 4 KiB page)
pub const PAGE_ALIGN: usize = 4096;

/// Page-aligned word buffer
///
/// The allocation is fixed at construction; it cannot grow or shrink.
pub struct RegionBuffer {
    ptr: NonNull<AtomicU64>,
    words: usize,
    layout: Layout,
}

// SAFETY: the buffer is only ever accessed through `&[AtomicU64]`
unsafe impl Send for RegionBuffer {}
unsafe impl Sync for RegionBuffer {}

impl RegionBuffer {
    /// Allocate `len` zeroed bytes aligned to `alignment`
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is zero or not a multiple of 8, if the
    /// alignment is not a power of two of at least 8, or if allocation fails.
    pub fn new(len: usize, alignment: usize) -> crate::Result<Self> {
        if len == 0 || len % WORD_BYTES != 0 {
            anyhow::bail!("region length must be a non-zero multiple of {} bytes, got {}", WORD_BYTES, len);
        }
        if !alignment.is_power_of_two() || alignment < WORD_BYTES {
            anyhow::bail!("alignment must be a power of two >= {}, got {}", WORD_BYTES, alignment);
        }

        let layout = Layout::from_size_align(len, alignment)
            .with_context(|| format!("Invalid layout for {} bytes aligned to {}", len, alignment))?;

        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw as *mut AtomicU64)
            .with_context(|| format!("Failed to allocate {} byte region", len))?;

        Ok(Self {
            ptr,
            words: len / WORD_BYTES,
            layout,
        })
    }

    /// Allocate a page-aligned buffer and return a view over all of it
    pub fn allocate(len: usize) -> crate::Result<MemoryRegion> {
        Ok(MemoryRegion::new(Arc::new(Self::new(len, PAGE_ALIGN)?)))
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.words * WORD_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.words == 0
    }

    /// Alignment of the allocation
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    fn words(&self) -> &[AtomicU64] {
        // SAFETY: ptr is valid for `words` zero-initialized u64s for the lifetime
        // of self, and AtomicU64 has the same layout as u64
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.words) }
    }
}

impl Drop for RegionBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout
        unsafe { dealloc(self.ptr.as_ptr() as *mut u8, self.layout) };
    }
}

impl std::fmt::Debug for RegionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionBuffer")
            .field("len", &self.len())
            .field("alignment", &self.alignment())
            .finish()
    }
}

/// View into a [`RegionBuffer`]
///
/// Cloning a view is cheap. All offsets are in bytes, relative to the start of
/// the view, and must be 8-byte aligned.
#[derive(Clone)]
pub struct MemoryRegion {
    buffer: Arc<RegionBuffer>,
    start_word: usize,
    words: usize,
}

impl MemoryRegion {
    /// View over the whole buffer
    pub fn new(buffer: Arc<RegionBuffer>) -> Self {
        let words = buffer.words;
        Self {
            buffer,
            start_word: 0,
            words,
        }
    }

    /// Length of the view in bytes
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.words * WORD_BYTES
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.words == 0
    }

    /// Sub-view over `range` (byte offsets relative to this view)
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds or not word aligned.
    pub fn slice(&self, range: Range<usize>) -> crate::Result<MemoryRegion> {
        if range.start > range.end || range.end > self.len() {
            anyhow::bail!("slice {:?} out of bounds for region of {} bytes", range, self.len());
        }
        if range.start % WORD_BYTES != 0 || range.end % WORD_BYTES != 0 {
            anyhow::bail!("slice {:?} is not {}-byte aligned", range, WORD_BYTES);
        }
        Ok(Self {
            buffer: Arc::clone(&self.buffer),
            start_word: self.start_word + range.start / WORD_BYTES,
            words: (range.end - range.start) / WORD_BYTES,
        })
    }

    /// Split into `parts` equal, word-aligned, non-overlapping views
    ///
    /// Any remainder at the end of the region is left out.
    pub fn split(&self, parts: usize, granularity: usize) -> crate::Result<Vec<MemoryRegion>> {
        if parts == 0 {
            anyhow::bail!("cannot split a region into zero parts");
        }
        let granularity = granularity.max(WORD_BYTES);
        let chunk = self.len() / parts / granularity * granularity;
        if chunk == 0 {
            anyhow::bail!(
                "region of {} bytes is too small for {} parts of {}-byte granularity",
                self.len(),
                parts,
                granularity
            );
        }
        (0..parts)
            .map(|i| self.slice(i * chunk..(i + 1) * chunk))
            .collect()
    }

    /// All words of the view
    #[inline(always)]
    pub fn words(&self) -> &[AtomicU64] {
        &self.buffer.words()[self.start_word..self.start_word + self.words]
    }

    /// Load the word at byte `offset`
    #[inline(always)]
    pub fn load(&self, offset: usize) -> u64 {
        self.words()[offset / WORD_BYTES].load(Ordering::Relaxed)
    }

    /// Store `value` at byte `offset`
    #[inline(always)]
    pub fn store(&self, offset: usize, value: u64) {
        self.words()[offset / WORD_BYTES].store(value, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("offset", &(self.start_word * WORD_BYTES))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_alignment() {
        let buffer = RegionBuffer::new(8192, 4096).unwrap();
        assert_eq!(buffer.len(), 8192);
        assert_eq!(buffer.ptr.as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn test_buffer_zeroed() {
        let region = RegionBuffer::allocate(4096).unwrap();
        assert!(region.words().iter().all(|w| w.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn test_buffer_rejects_bad_sizes() {
        assert!(RegionBuffer::new(0, 4096).is_err());
        assert!(RegionBuffer::new(12, 4096).is_err());
        assert!(RegionBuffer::new(4096, 12).is_err());
    }

    #[test]
    fn test_load_store() {
        let region = RegionBuffer::allocate(1024).unwrap();
        region.store(64, 0xdead_beef);
        assert_eq!(region.load(64), 0xdead_beef);
        assert_eq!(region.load(56), 0);
    }

    #[test]
    fn test_slice_is_relative_view() {
        let region = RegionBuffer::allocate(1024).unwrap();
        let tail = region.slice(512..1024).unwrap();
        assert_eq!(tail.len(), 512);
        tail.store(0, 7);
        assert_eq!(region.load(512), 7);

        let inner = tail.slice(64..128).unwrap();
        inner.store(8, 9);
        assert_eq!(region.load(512 + 64 + 8), 9);
    }

    #[test]
    fn test_slice_bounds() {
        let region = RegionBuffer::allocate(1024).unwrap();
        assert!(region.slice(0..2048).is_err());
        assert!(region.slice(4..64).is_err());
        assert!(region.slice(0..0).unwrap().is_empty());
    }

    #[test]
    fn test_split_equal_parts() {
        let region = RegionBuffer::allocate(64 * 1024).unwrap();
        let parts = region.split(3, 4096).unwrap();
        assert_eq!(parts.len(), 3);
        for part in &parts {
            assert_eq!(part.len(), 20 * 1024);
        }
        parts[1].store(0, 1);
        assert_eq!(region.load(20 * 1024), 1);

        assert!(region.split(0, 4096).is_err());
        assert!(region.split(32, 4096).is_err());
    }
}
