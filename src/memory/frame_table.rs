//! Per-frame reference-count side table, keyed by physical frame rather than
//! by VMA (`memory::vma` tracks mapping-level refcounts separately). This is
//! what copy-on-write actually needs: two VMAs across two address spaces can
//! point at the same frame after `fork`, and only a frame-keyed count tells
//! `vmm::handle_page_fault` when it is safe to return the frame to the PFA.
//! Built in the same self-hosting, direct-mapped style as `memory::pfa`'s
//! bitmap — it has the same chicken-and-egg problem, since it must exist
//! before `memory::heap` does (anonymous VMA frames come straight from PFA,
//! never from the heap).

use spin::Mutex;

use crate::memory::layout::{align_up, KERNEL_BASE, PAGE_SIZE};
use crate::memory::pfa;

struct Table {
    ptr: *mut u16,
    len: usize,
}

// SAFETY: mediated entirely by `TABLE`'s spinlock.
unsafe impl Send for Table {}

static TABLE: Mutex<Option<Table>> = Mutex::new(None);

/// Reserves and zeroes the refcount array. Must run after `pfa::init` (it
/// needs `pfa::total_frames()`) and before the first `vmm::fork`/COW fault.
/// Idempotent.
pub fn init() {
    let mut guard = TABLE.lock();
    if guard.is_some() {
        return;
    }
    let total = pfa::total_frames();
    let bytes = total * core::mem::size_of::<u16>();
    let pages = (align_up(bytes as u64, PAGE_SIZE as u64) / PAGE_SIZE as u64).max(1) as usize;
    let base = match pfa::alloc_frames(pages) {
        Some(a) => a,
        None => crate::corrupted!("frame_table: no memory for refcount side table"),
    };
    let ptr = (KERNEL_BASE + base) as *mut u16;
    unsafe { core::ptr::write_bytes(ptr, 0, pages * PAGE_SIZE) };
    *guard = Some(Table { ptr, len: total });
}

fn frame_index(phys_addr: u64) -> usize {
    (phys_addr / PAGE_SIZE as u64) as usize
}

/// Sets a freshly allocated frame's count to 1. Every frame that backs a
/// present leaf PTE must go through this exactly once before any `inc`/`dec`.
pub fn set_initial(phys_addr: u64) {
    let guard = TABLE.lock();
    if let Some(t) = guard.as_ref() {
        let i = frame_index(phys_addr);
        if i < t.len {
            unsafe { *t.ptr.add(i) = 1 };
        }
    }
}

/// Bumped once per child on `fork`, for every parent frame behind a
/// currently-present leaf PTE.
pub fn inc(phys_addr: u64) {
    let guard = TABLE.lock();
    if let Some(t) = guard.as_ref() {
        let i = frame_index(phys_addr);
        if i < t.len {
            unsafe {
                let p = t.ptr.add(i);
                *p = (*p).saturating_add(1);
            }
        }
    }
}

/// Decrements on COW-break or unmap. Returns `true` when the count reaches
/// zero, meaning the caller now owns the frame's last reference and must
/// return it to the PFA.
pub fn dec(phys_addr: u64) -> bool {
    let guard = TABLE.lock();
    match guard.as_ref() {
        Some(t) => {
            let i = frame_index(phys_addr);
            if i >= t.len {
                return true;
            }
            unsafe {
                let p = t.ptr.add(i);
                *p = p.read().saturating_sub(1);
                *p == 0
            }
        }
        None => true,
    }
}

pub fn count(phys_addr: u64) -> u16 {
    let guard = TABLE.lock();
    match guard.as_ref() {
        Some(t) => {
            let i = frame_index(phys_addr);
            if i < t.len {
                unsafe { *t.ptr.add(i) }
            } else {
                0
            }
        }
        None => 0,
    }
}
