//! Physical Frame Allocator — single source of truth for frame ownership.
//!
//! A self-hosting bitmap, following the bit-test/mark-used shape of a
//! classic physical memory manager (scan for a free run, mark it used, clear
//! it on free). The bitmap itself cannot live behind the global allocator —
//! `KernelHeap` is built on top of this allocator — so it is addressed
//! directly through the kernel's physical-memory direct map
//! (`memory::layout::KERNEL_BASE`), the same way page tables are reached
//! before a heap exists.

use spin::Mutex;

use crate::error::{KResult, KernelError};
use crate::memory::frame::{BootInfo, Frame, RegionKind};
use crate::memory::layout::{align_up, is_aligned, KERNEL_BASE, PAGE_SIZE};

/// Frames freed singly are pushed here first; popped first on single-frame
/// allocation. Bounded so the cache itself never needs dynamic growth.
const CACHE_CAPACITY: usize = 512;

/// Below this many free frames, nothing is cached — every freed frame goes
/// straight back to the bitmap so allocation pressure sees it immediately.
const DEFAULT_LOW_WATERMARK: usize = 64;

#[inline]
fn direct_map(phys: u64) -> *mut u8 {
    (KERNEL_BASE + phys) as *mut u8
}

struct Bitmap {
    ptr: *mut u8,
    bits: usize,
}

// SAFETY: all access to `Bitmap` is mediated by `Pfa`'s spinlock; the raw
// pointer is never touched concurrently.
unsafe impl Send for Bitmap {}

impl Bitmap {
    #[inline]
    fn test(&self, i: usize) -> bool {
        unsafe {
            let byte = *self.ptr.add(i / 8);
            (byte & (1 << (i % 8))) != 0
        }
    }

    #[inline]
    fn set(&mut self, i: usize) {
        unsafe {
            let p = self.ptr.add(i / 8);
            *p |= 1 << (i % 8);
        }
    }

    #[inline]
    fn clear(&mut self, i: usize) {
        unsafe {
            let p = self.ptr.add(i / 8);
            *p &= !(1 << (i % 8));
        }
    }

    fn zero(&mut self) {
        unsafe { core::ptr::write_bytes(self.ptr, 0, (self.bits + 7) / 8) };
    }

    /// First-pass best-fit scan: the smallest contiguous run of free bits
    /// that is at least `n` frames long. Single linear pass over the bitmap,
    /// O(total_frames).
    fn find_best_fit(&self, n: usize) -> Option<usize> {
        let mut best_start = None;
        let mut best_len = usize::MAX;
        let mut i = 0;
        while i < self.bits {
            if self.test(i) {
                i += 1;
                continue;
            }
            let run_start = i;
            let mut run_len = 0;
            while i < self.bits && !self.test(i) {
                run_len += 1;
                i += 1;
            }
            if run_len >= n && run_len < best_len {
                best_len = run_len;
                best_start = Some(run_start);
                if run_len == n {
                    break;
                }
            }
        }
        best_start
    }

    /// Length of the single largest free run, for fragmentation reporting.
    fn largest_free_run(&self) -> usize {
        let mut best = 0;
        let mut i = 0;
        while i < self.bits {
            if self.test(i) {
                i += 1;
                continue;
            }
            let mut run_len = 0;
            while i < self.bits && !self.test(i) {
                run_len += 1;
                i += 1;
            }
            best = best.max(run_len);
        }
        best
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PfaStats {
    pub requests: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub single_frame_requests: u64,
    /// `(free - largest_run) / free`, expressed in basis points (0..=10000)
    /// so the stat stays an integer in a `no_std` crate with no float
    /// formatting machinery.
    pub fragmentation_bp: u32,
}

struct Pfa {
    bitmap: Bitmap,
    total_frames: usize,
    free_count: usize,
    low_watermark: usize,
    hot: [Frame; CACHE_CAPACITY],
    hot_len: usize,
    cold: [Frame; CACHE_CAPACITY],
    cold_len: usize,
    stats: PfaStats,
}

impl Pfa {
    fn mark_allocated_range(&mut self, start: usize, n: usize) {
        for i in start..start + n {
            debug_assert!(!self.bitmap.test(i), "double-allocation of frame {i}");
            self.bitmap.set(i);
        }
        self.free_count -= n;
    }

    fn alloc(&mut self, n_pages: usize) -> Option<u64> {
        if cfg!(feature = "pfa-stats") {
            self.stats.requests += 1;
        }
        if n_pages == 0 {
            if cfg!(feature = "pfa-stats") {
                self.stats.failures += 1;
            }
            return None;
        }

        if n_pages == 1 {
            if cfg!(feature = "pfa-stats") {
                self.stats.single_frame_requests += 1;
            }
            if self.hot_len > 0 && self.free_count > self.low_watermark {
                self.hot_len -= 1;
                let frame = self.hot[self.hot_len];
                if cfg!(feature = "pfa-stats") {
                    self.stats.cache_hits += 1;
                }
                return Some(frame.start_address());
            }
        }

        match self.bitmap.find_best_fit(n_pages) {
            Some(start) => {
                self.mark_allocated_range(start, n_pages);
                Some((start as u64) * PAGE_SIZE as u64)
            }
            None => {
                if cfg!(feature = "pfa-stats") {
                    self.stats.failures += 1;
                }
                None
            }
        }
    }

    fn free(&mut self, phys_addr: u64, n_pages: usize) -> KResult<()> {
        if !is_aligned(phys_addr, PAGE_SIZE as u64) {
            return Err(KernelError::InvalidArgument);
        }
        let start = (phys_addr / PAGE_SIZE as u64) as usize;
        if n_pages == 0 || start + n_pages > self.total_frames {
            return Err(KernelError::InvalidArgument);
        }
        for i in start..start + n_pages {
            if !self.bitmap.test(i) {
                crate::log::log_err("pfa: double free detected, ignoring");
                return Err(KernelError::DoubleFree);
            }
        }

        if n_pages == 1
            && self.free_count > self.low_watermark * 2
            && self.cold_len == CACHE_CAPACITY
            && self.hot_len < CACHE_CAPACITY
        {
            // bit stays set: the frame is owned by the cache, not the free
            // pool.
            self.hot[self.hot_len] = Frame::containing(phys_addr);
            self.hot_len += 1;
            return Ok(());
        }
        if n_pages == 1 && self.free_count > self.low_watermark && self.hot_len < CACHE_CAPACITY {
            self.hot[self.hot_len] = Frame::containing(phys_addr);
            self.hot_len += 1;
            return Ok(());
        }

        for i in start..start + n_pages {
            self.bitmap.clear(i);
        }
        self.free_count += n_pages;
        Ok(())
    }

    fn stats_snapshot(&self) -> PfaStats {
        let mut s = self.stats;
        if cfg!(feature = "pfa-stats") && self.free_count > 0 {
            let largest = self.bitmap.largest_free_run();
            s.fragmentation_bp =
                (((self.free_count - largest) as u64 * 10_000) / self.free_count as u64) as u32;
        }
        s
    }
}

static PFA: Mutex<Option<Pfa>> = Mutex::new(None);

/// Walks the boot-provided memory map, places the self-hosting bitmap at the
/// aligned end of the kernel image inside the largest available region, and
/// pre-marks the kernel image, the bitmap itself, and the boot-info blob as
/// allocated. Panics if no available region exists or the bitmap cannot fit,
/// matching §4.A's fatal-init contract (there is no recovery path for a
/// kernel that cannot account for its own memory).
pub fn init(boot: &BootInfo) {
    let mut largest: Option<(u64, u64)> = None;
    for region in boot.memory_map.iter() {
        if region.kind != RegionKind::Available {
            continue;
        }
        if largest.map_or(true, |(_, len)| region.length > len) {
            largest = Some((region.base, region.length));
        }
    }
    let (region_base, region_len) =
        largest.unwrap_or_else(|| crate::corrupted!("pfa: no available memory region at init"));

    let limit = region_base + region_len;
    let total_frames = (limit / PAGE_SIZE as u64) as usize;
    let bitmap_bytes = (total_frames + 7) / 8;

    let bitmap_phys = align_up(boot.kernel_image_range.1, PAGE_SIZE as u64);
    if bitmap_phys + bitmap_bytes as u64 > limit {
        crate::corrupted!("pfa: bitmap does not fit in the largest available region");
    }

    let mut bitmap = Bitmap { ptr: direct_map(bitmap_phys), bits: total_frames };
    bitmap.zero();

    let mut pfa = Pfa {
        bitmap,
        total_frames,
        free_count: total_frames,
        low_watermark: DEFAULT_LOW_WATERMARK,
        hot: [Frame::from_index(0); CACHE_CAPACITY],
        hot_len: 0,
        cold: [Frame::from_index(0); CACHE_CAPACITY],
        cold_len: 0,
        stats: PfaStats::default(),
    };

    let mut premark = |base: u64, end: u64| {
        let start_page = (base / PAGE_SIZE as u64) as usize;
        let end_page = (align_up(end, PAGE_SIZE as u64) / PAGE_SIZE as u64) as usize;
        pfa.mark_allocated_range(start_page, end_page.saturating_sub(start_page));
    };
    premark(boot.kernel_image_range.0, boot.kernel_image_range.1);
    premark(bitmap_phys, bitmap_phys + bitmap_bytes as u64);
    premark(boot.boot_info_range.0, boot.boot_info_range.1);

    *PFA.lock() = Some(pfa);
    crate::log::log_info("pfa: initialized");
}

/// Allocates a physically contiguous run of `n_pages` frames.
pub fn alloc_frames(n_pages: usize) -> Option<u64> {
    let mut guard = PFA.lock();
    let pfa = guard.as_mut().expect("pfa::alloc_frames called before init");
    pfa.alloc(n_pages)
}

/// Returns `n_pages` frames starting at `phys_addr` to the allocator. A
/// misuse (misaligned address, out-of-range, or already-free frame) is
/// logged as a [`KernelError::DoubleFree`]/[`KernelError::InvalidArgument`]
/// and otherwise ignored — it must never corrupt the bitmap.
pub fn free_frames(phys_addr: u64, n_pages: usize) {
    let mut guard = PFA.lock();
    let pfa = guard.as_mut().expect("pfa::free_frames called before init");
    if let Err(e) = pfa.free(phys_addr, n_pages) {
        crate::log::log_warn("pfa: free rejected");
        let _ = e;
    }
}

pub fn stats() -> PfaStats {
    let guard = PFA.lock();
    guard.as_ref().map(Pfa::stats_snapshot).unwrap_or_default()
}

/// Total frame count covered by the bitmap, i.e. `physical_memory_limit /
/// PAGE_SIZE`. Used by [`crate::memory::frame_table`] to size the per-frame
/// refcount side table.
pub fn total_frames() -> usize {
    let guard = PFA.lock();
    guard.as_ref().map(|p| p.total_frames).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, Layout};

    /// Builds a `Pfa` over a host-allocated buffer standing in for physical
    /// memory, bypassing the direct-map indirection so the bitmap logic can
    /// be exercised off target without a real kernel image or boot info blob.
    fn test_pfa(total_frames: usize) -> Pfa {
        let bytes = (total_frames + 7) / 8;
        let layout = Layout::from_size_align(bytes.max(1), 8).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        Pfa {
            bitmap: Bitmap { ptr, bits: total_frames },
            total_frames,
            free_count: total_frames,
            low_watermark: 4,
            hot: [Frame::from_index(0); CACHE_CAPACITY],
            hot_len: 0,
            cold: [Frame::from_index(0); CACHE_CAPACITY],
            cold_len: 0,
            stats: PfaStats::default(),
        }
    }

    #[test]
    fn hot_cache_hit_is_lifo() {
        // S1: 4 MiB region ⇒ 1024 frames, well above the low watermark.
        let mut pfa = test_pfa(1024);
        let a = pfa.alloc(1).unwrap();
        pfa.free(a, 1).unwrap();
        let b = pfa.alloc(1).unwrap();
        assert_eq!(a, b, "last-freed single frame must be reused first");
    }

    #[test]
    fn alloc_free_roundtrip_restores_bitmap() {
        let mut pfa = test_pfa(256);
        let before = pfa.free_count;
        let addr = pfa.alloc(8).unwrap();
        assert_eq!(pfa.free_count, before - 8);
        pfa.free(addr, 8).unwrap();
        assert_eq!(pfa.free_count, before);
    }

    #[test]
    fn best_fit_picks_smallest_adequate_run() {
        let mut pfa = test_pfa(64);
        // Carve out: [0..10) busy, [10..14) free(4), [14..20) busy, [20..30) free(10)
        pfa.mark_allocated_range(0, 10);
        pfa.mark_allocated_range(14, 6);
        for i in 30..64 {
            pfa.bitmap.set(i);
        }
        pfa.free_count = 4 + 10;
        let addr = pfa.alloc(3).unwrap();
        assert_eq!(addr / PAGE_SIZE as u64, 10, "should land in the 4-frame run, not the 10-frame one");
    }

    #[test]
    fn double_free_is_rejected_without_mutation() {
        let mut pfa = test_pfa(64);
        let free_before = pfa.free_count;
        let result = pfa.free(0, 1);
        assert_eq!(result, Err(KernelError::DoubleFree));
        assert_eq!(pfa.free_count, free_before);
    }

    #[test]
    fn out_of_memory_returns_none_never_panics() {
        let mut pfa = test_pfa(4);
        for i in 0..4 {
            pfa.bitmap.set(i);
        }
        pfa.free_count = 0;
        assert_eq!(pfa.alloc(1), None);
        assert_eq!(pfa.stats.failures, 1);
    }

    #[test]
    fn fragmentation_reports_zero_when_fully_free() {
        let pfa = test_pfa(16);
        let snap = pfa.stats_snapshot();
        assert_eq!(snap.fragmentation_bp, 0);
    }
}
