//! Page-Table Walker — mechanical installation and removal of mappings.
//!
//! Knows nothing about VMAs; `memory::vmm` is the policy layer built on top.
//! Direct-map table access (no recursive-mapping slot needed for walking
//! itself) and per-level index math, parameterized over an arbitrary root
//! frame so `vmm::AddressSpace` can own one per task rather than a single
//! hardcoded kernel address space.

use x86_64::structures::paging::{PageTable, PageTableFlags as Flags};
use x86_64::PhysAddr;

use crate::error::{KResult, KernelError};
use crate::memory::frame::Frame;
use crate::memory::layout::{align_down, is_aligned, HUGE_1G, HUGE_2M, KERNEL_BASE, PAGE_SIZE};
use crate::memory::pfa;
use crate::memory::pte::Prot;

#[inline]
fn l4_idx(va: u64) -> usize {
    ((va >> 39) & 0x1ff) as usize
}
#[inline]
fn l3_idx(va: u64) -> usize {
    ((va >> 30) & 0x1ff) as usize
}
#[inline]
fn l2_idx(va: u64) -> usize {
    ((va >> 21) & 0x1ff) as usize
}
#[inline]
fn l1_idx(va: u64) -> usize {
    ((va >> 12) & 0x1ff) as usize
}

/// The core runs with a direct map of all physical memory at `KERNEL_BASE`
/// (see `memory::layout`), so every page-table frame is reachable without a
/// dedicated recursive-mapping slot for table *walking* itself.
#[inline]
unsafe fn table_at(frame: Frame) -> &'static mut PageTable {
    &mut *((KERNEL_BASE + frame.start_address()) as *mut PageTable)
}

fn alloc_table_frame() -> KResult<Frame> {
    let addr = pfa::alloc_frames(1).ok_or(KernelError::OutOfMemory)?;
    let frame = Frame::containing(addr);
    unsafe {
        core::ptr::write_bytes((KERNEL_BASE + addr) as *mut u8, 0, PAGE_SIZE);
    }
    Ok(frame)
}

/// Descends from `root` to the leaf (L1) table entry for `vaddr`, allocating
/// missing intermediate tables when `create` is true. A 2 MiB/1 GiB huge
/// entry encountered mid-walk short-circuits with `None` — huge pages are
/// recognized but never synthesized by the core (§4.B).
///
/// Returns a raw pointer to the leaf entry so `map`/`unmap`/`translate` can
/// read or write it directly; the pointer is valid as long as the owning
/// address space's lock is held.
pub fn walk(root: Frame, vaddr: u64, create: bool) -> KResult<Option<*mut x86_64::structures::paging::PageTableEntry>> {
    unsafe {
        let l4 = table_at(root);
        let e4 = &mut l4[l4_idx(vaddr)];
        if e4.is_unused() {
            if !create {
                return Ok(None);
            }
            let f = alloc_table_frame()?;
            e4.set_addr(PhysAddr::new(f.start_address()), Flags::PRESENT | Flags::WRITABLE);
        }
        let l3 = table_at(Frame::containing(e4.addr().as_u64()));

        let e3 = &mut l3[l3_idx(vaddr)];
        if e3.flags().contains(Flags::HUGE_PAGE) {
            return Ok(None);
        }
        if e3.is_unused() {
            if !create {
                return Ok(None);
            }
            let f = alloc_table_frame()?;
            e3.set_addr(PhysAddr::new(f.start_address()), Flags::PRESENT | Flags::WRITABLE);
        }
        let l2 = table_at(Frame::containing(e3.addr().as_u64()));

        let e2 = &mut l2[l2_idx(vaddr)];
        if e2.flags().contains(Flags::HUGE_PAGE) {
            return Ok(None);
        }
        if e2.is_unused() {
            if !create {
                return Ok(None);
            }
            let f = alloc_table_frame()?;
            e2.set_addr(PhysAddr::new(f.start_address()), Flags::PRESENT | Flags::WRITABLE);
        }
        let l1 = table_at(Frame::containing(e2.addr().as_u64()));

        Ok(Some(&mut l1[l1_idx(vaddr)] as *mut _))
    }
}

/// Installs a 4 KiB mapping `vaddr -> paddr` with `prot`, creating
/// intermediate tables as needed. Idempotent on retry after a partial
/// failure: a later call simply continues the walk from whatever tables
/// already exist.
pub fn map(root: Frame, vaddr: u64, paddr: u64, prot: Prot, user: bool) -> KResult<()> {
    #[cfg(feature = "wx-audit")]
    assert_wx_exclusive(prot);
    let pte = walk(root, vaddr, true)?.ok_or(KernelError::InvalidArgument)?;
    let flags = prot.to_table_flags(user);
    unsafe {
        (*pte).set_addr(PhysAddr::new(align_down(paddr, PAGE_SIZE as u64)), flags);
    }
    crate::platform::cpu::invlpg(vaddr);
    Ok(())
}

/// Removes a mapping if present, returning the frame it pointed to. Leaves
/// intermediate (L2/L3/L4) tables in place even if they become fully empty —
/// reaped only at address-space teardown, never here. Idempotent: unmapping
/// an already-unmapped page is a no-op that returns `None`.
pub fn unmap(root: Frame, vaddr: u64) -> Option<Frame> {
    let pte = walk(root, vaddr, false).ok().flatten()?;
    unsafe {
        if !(*pte).flags().contains(Flags::PRESENT) {
            return None;
        }
        let frame = Frame::containing((*pte).addr().as_u64());
        (*pte).set_unused();
        crate::platform::cpu::invlpg(vaddr);
        Some(frame)
    }
}

/// Read-only walk honoring 1 GiB/2 MiB huge entries. Returns the translated
/// physical address, or `None` if any level along the path is not present.
pub fn translate(root: Frame, vaddr: u64) -> Option<u64> {
    unsafe {
        let l4 = table_at(root);
        let e4 = &l4[l4_idx(vaddr)];
        if e4.is_unused() {
            return None;
        }
        let l3 = table_at(Frame::containing(e4.addr().as_u64()));

        let e3 = &l3[l3_idx(vaddr)];
        if e3.is_unused() {
            return None;
        }
        if e3.flags().contains(Flags::HUGE_PAGE) {
            let base = e3.addr().as_u64();
            return Some(base + (vaddr & (HUGE_1G as u64 - 1)));
        }
        let l2 = table_at(Frame::containing(e3.addr().as_u64()));

        let e2 = &l2[l2_idx(vaddr)];
        if e2.is_unused() {
            return None;
        }
        if e2.flags().contains(Flags::HUGE_PAGE) {
            let base = e2.addr().as_u64();
            return Some(base + (vaddr & (HUGE_2M as u64 - 1)));
        }
        let l1 = table_at(Frame::containing(e2.addr().as_u64()));

        let e1 = &l1[l1_idx(vaddr)];
        if !e1.flags().contains(Flags::PRESENT) {
            return None;
        }
        Some(e1.addr().as_u64() + (vaddr & (PAGE_SIZE as u64 - 1)))
    }
}

/// Allocates and zeroes a fresh root (PML4) frame for a new address space.
pub fn new_root() -> KResult<Frame> {
    alloc_table_frame()
}

/// Copies PML4 entries `256..512` (the higher half) from `kernel_root` into
/// `root`, so kernel-only mappings installed once against `kernel_root` —
/// the heap's reserved window, the frame refcount table, anything
/// `memory::heap`/`memory::frame_table` map outside the direct-mapped
/// physical range — are visible from every task's address space without
/// re-walking. Avoids modeling a separate user/kernel PML4 pair.
pub fn share_kernel_half(root: Frame, kernel_root: Frame) {
    unsafe {
        let dst = table_at(root);
        let src = table_at(kernel_root);
        for i in 256..512 {
            dst[i] = src[i].clone();
        }
    }
}

#[inline]
pub fn is_page_aligned(addr: u64) -> bool {
    is_aligned(addr, PAGE_SIZE as u64)
}

/// Panics if `prot` is both writable and executable. Every mapping installed
/// through `map` goes through this when `wx-audit` is enabled; a VMA that
/// genuinely needs self-modifying-code semantics is not something the core
/// supports, so catching it here is preferable to a silent W^X violation
/// surviving into a page table.
#[cfg(feature = "wx-audit")]
fn assert_wx_exclusive(prot: Prot) {
    if prot.write() && prot.exec() {
        crate::corrupted!("wx-audit: attempted writable+executable mapping");
    }
}

#[cfg(all(test, feature = "wx-audit"))]
mod wx_audit_tests {
    use super::*;

    #[test]
    fn rw_and_rx_pass() {
        assert_wx_exclusive(Prot::RW);
        assert_wx_exclusive(Prot::RX);
        assert_wx_exclusive(Prot::NONE);
    }

    #[test]
    #[should_panic(expected = "wx-audit")]
    fn write_plus_exec_panics() {
        assert_wx_exclusive(Prot::WRITE | Prot::EXEC);
    }
}
