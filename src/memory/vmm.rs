//! Virtual Memory Manager — the policy layer above the page-table walker.
//!
//! Each task owns an `AddressSpace`: a root page-table frame plus a sorted
//! VMA list, supporting demand paging and `fork`-time copy-on-write. The VMA
//! list is kept as a plain sorted `Vec` rather than an intrusive structure —
//! region counts per address space are small, and `alloc::vec::Vec` is
//! available once `memory::heap` installs the global allocator.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KResult, KernelError};
use crate::memory::frame::Frame;
use crate::memory::frame_table;
use crate::memory::layout::{align_down, align_up, is_aligned, KERNEL_BASE, PAGE_SIZE};
use crate::memory::paging;
use crate::memory::pte::Prot;
use crate::memory::vma::{MappingKind, Vma};
use crate::platform::PageFaultErrorCode;

bitflags::bitflags! {
    pub struct MmapFlags: u8 {
        const PRIVATE   = 1 << 0;
        const SHARED    = 1 << 1;
        const ANONYMOUS = 1 << 2;
        const FIXED     = 1 << 3;
    }
}

struct Inner {
    root: Frame,
    vmas: Vec<Vma>,
    brk: u64,
    mmap_base: u64,
}

/// A task's set of mappings. Cheaply `Clone`-able (an `Arc` bump) so a
/// `spawn` that inherits rather than forks can hand the same context to two
/// TCBs; the last task to drop its handle frees the PML4 and every mapping
/// still present in it.
#[derive(Clone)]
pub struct AddressSpace(Arc<Mutex<Inner>>);

/// Default search start for new `mmap`s absent a hint; kept well above the
/// heap's own reserved window (`memory::layout::HEAP_BASE`) so user/anon
/// mappings never collide with kernel heap growth.
const DEFAULT_MMAP_BASE: u64 = 0x_7000_0000_0000;

impl AddressSpace {
    /// Allocates a fresh PML4, shares in the kernel half (see
    /// [`kernel_root`]), and starts with an empty VMA list.
    pub fn new() -> KResult<Self> {
        let root = paging::new_root()?;
        paging::share_kernel_half(root, kernel_root());
        Ok(AddressSpace(Arc::new(Mutex::new(Inner {
            root,
            vmas: Vec::new(),
            brk: 0,
            mmap_base: DEFAULT_MMAP_BASE,
        }))))
    }

    pub fn root(&self) -> Frame {
        self.0.lock().root
    }

    /// Creates one VMA and reserves virtual address space for it. No frames
    /// are allocated or mapped for `ANONYMOUS | PRIVATE` — demand paging
    /// handles first touch.
    pub fn mmap(
        &self,
        hint: Option<u64>,
        length: u64,
        prot: Prot,
        flags: MmapFlags,
        kind_args: Option<(u64, u64)>,
    ) -> KResult<u64> {
        if length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let length = align_up(length, PAGE_SIZE as u64);

        let kind = match (flags.contains(MmapFlags::ANONYMOUS), flags.contains(MmapFlags::SHARED)) {
            (true, false) => MappingKind::PrivateAnon,
            (true, true) => MappingKind::SharedAnon,
            (false, false) => {
                let (file, offset) = kind_args.ok_or(KernelError::InvalidArgument)?;
                MappingKind::PrivateFile { file, offset }
            }
            (false, true) => {
                let (file, offset) = kind_args.ok_or(KernelError::InvalidArgument)?;
                MappingKind::SharedFile { file, offset }
            }
        };

        let mut inner = self.0.lock();

        let start = if flags.contains(MmapFlags::FIXED) {
            let h = hint.ok_or(KernelError::InvalidArgument)?;
            if !is_aligned(h, PAGE_SIZE as u64) {
                return Err(KernelError::InvalidArgument);
            }
            let end = h.checked_add(length).ok_or(KernelError::InvalidArgument)?;
            if inner.vmas.iter().any(|v| v.overlaps(h, end)) {
                return Err(KernelError::InvalidArgument);
            }
            h
        } else {
            find_gap(&inner.vmas, hint.unwrap_or(inner.mmap_base), length)?
        };

        let vma = Vma { start, end: start + length, prot, kind, refcount: 1 };
        insert_sorted(&mut inner.vmas, vma);
        Ok(start)
    }

    /// Unmaps every present page across `[addr, addr+length)`, freeing
    /// frames back to the PFA (subject to the frame refcount table), and
    /// removes/splits the VMAs it intersects.
    pub fn munmap(&self, addr: u64, length: u64) -> KResult<()> {
        if length == 0 || !is_aligned(addr, PAGE_SIZE as u64) {
            return Err(KernelError::InvalidArgument);
        }
        let end = addr.checked_add(align_up(length, PAGE_SIZE as u64)).ok_or(KernelError::InvalidArgument)?;

        let mut inner = self.0.lock();
        let root = inner.root;

        let mut remaining = Vec::with_capacity(inner.vmas.len());
        for v in inner.vmas.drain(..) {
            if !v.overlaps(addr, end) {
                remaining.push(v);
                continue;
            }
            // Unmap the intersecting pages regardless of how the VMA ends up split.
            let lo = v.start.max(addr);
            let hi = v.end.min(end);
            unmap_range(root, lo, hi);

            if v.start < lo {
                remaining.push(Vma { start: v.start, end: lo, ..v });
            }
            if hi < v.end {
                remaining.push(Vma { start: hi, end: v.end, ..v });
            }
        }
        remaining.sort_by_key(|v| v.start);
        inner.vmas = remaining;
        Ok(())
    }

    /// Grows or shrinks the heap cursor. Shrinking unmaps the released
    /// range; growing creates (or extends) a single anonymous private VMA.
    /// Fails without mutation if growth would collide with an existing
    /// mapping above the heap.
    pub fn brk(&self, new_brk: u64) -> KResult<u64> {
        let mut inner = self.0.lock();
        let old_brk = inner.brk;

        if new_brk == old_brk {
            return Ok(old_brk);
        }

        if new_brk < old_brk {
            let shrink_from = align_up(new_brk, PAGE_SIZE as u64);
            let shrink_to = align_up(old_brk, PAGE_SIZE as u64);
            // A shrink within the same page releases no whole page — there
            // is nothing for `munmap` to do, but `brk` must still move.
            if shrink_to > shrink_from {
                drop(inner);
                self.munmap(shrink_from, shrink_to - shrink_from)?;
                inner = self.0.lock();
            }
            inner.brk = new_brk;
            return Ok(new_brk);
        }

        let grow_from = align_up(old_brk, PAGE_SIZE as u64);
        let grow_to = align_up(new_brk, PAGE_SIZE as u64);
        if inner.vmas.iter().any(|v| v.overlaps(grow_from, grow_to)) {
            return Err(KernelError::InvalidArgument);
        }

        if let Some(last) = inner.vmas.iter_mut().find(|v| v.end == grow_from && matches!(v.kind, MappingKind::PrivateAnon)) {
            last.end = grow_to;
        } else {
            let vma = Vma { start: grow_from, end: grow_to, prot: Prot::RW, kind: MappingKind::PrivateAnon, refcount: 1 };
            insert_sorted(&mut inner.vmas, vma);
        }
        inner.brk = new_brk;
        Ok(new_brk)
    }

    /// Clones every VMA into a new address space and downgrades every
    /// currently-present leaf mapping to read-only in both parent and
    /// child, bumping the backing frame's refcount once per child. Writes
    /// afterward fault into `handle_page_fault`'s COW path.
    pub fn fork(&self) -> KResult<AddressSpace> {
        let child = AddressSpace::new()?;
        let mut parent = self.0.lock();
        let mut child_inner = child.0.lock();
        child_inner.brk = parent.brk;
        child_inner.mmap_base = parent.mmap_base;

        for vma in parent.vmas.iter() {
            child_inner.vmas.push(Vma { refcount: vma.refcount + 1, ..*vma });

            if !vma.kind.is_private() {
                // Shared mappings keep pointing at the same frames without a
                // protection change; both spaces already see the same data.
                continue;
            }

            let mut va = vma.start;
            while va < vma.end {
                if let Some(paddr) = paging::translate(parent.root, va) {
                    let frame = Frame::containing(paddr);
                    // Downgrade parent to read-only so its next write takes
                    // the COW fault path too.
                    let _ = paging::map(parent.root, va, paddr, vma.prot - Prot::WRITE, false);
                    let _ = paging::map(child_inner.root, va, paddr, vma.prot - Prot::WRITE, false);
                    frame_table::inc(frame.start_address());
                }
                va += PAGE_SIZE as u64;
            }
        }
        drop(child_inner);
        Ok(child)
    }

    fn vma_containing(&self, inner: &Inner, vaddr: u64) -> Option<Vma> {
        let _ = self;
        inner.vmas.iter().find(|v| v.contains(vaddr)).copied()
    }
}

static KERNEL_ROOT: Mutex<Option<Frame>> = Mutex::new(None);

/// The kernel's own PML4, used for mappings that must be visible regardless
/// of which task's address space is active (`memory::heap`'s reserved
/// window, `memory::frame_table`'s side table when it isn't reachable
/// through the direct map). Lazily allocated on first use and shared into
/// every subsequently created [`AddressSpace`] via `paging::share_kernel_half`.
pub fn kernel_root() -> Frame {
    let mut guard = KERNEL_ROOT.lock();
    if let Some(f) = *guard {
        return f;
    }
    let f = paging::new_root().unwrap_or_else(|_| crate::corrupted!("vmm: out of memory allocating the kernel root PML4"));
    *guard = Some(f);
    f
}

fn find_gap(vmas: &[Vma], start_hint: u64, length: u64) -> KResult<u64> {
    let mut candidate = start_hint;
    for v in vmas {
        if v.start < candidate {
            continue;
        }
        if candidate.checked_add(length).ok_or(KernelError::InvalidArgument)? <= v.start {
            return Ok(candidate);
        }
        candidate = v.end;
    }
    candidate.checked_add(length).ok_or(KernelError::InvalidArgument)?;
    Ok(candidate)
}

fn insert_sorted(vmas: &mut Vec<Vma>, vma: Vma) {
    let pos = vmas.iter().position(|v| v.start > vma.start).unwrap_or(vmas.len());
    vmas.insert(pos, vma);
}

fn unmap_range(root: Frame, lo: u64, hi: u64) {
    let mut va = lo;
    while va < hi {
        if let Some(frame) = paging::unmap(root, va) {
            if frame_table::dec(frame.start_address()) {
                crate::memory::pfa::free_frames(frame.start_address(), 1);
            }
        }
        va += PAGE_SIZE as u64;
    }
}

/// Eagerly installs a single anonymous page within an existing VMA, used by
/// `sched::task` to pre-fault a new stack rather than rely on first-touch
/// demand paging for memory that must be usable before any trap path is
/// viable. Idempotent: a page already present is left untouched.
pub fn populate(ctx: &AddressSpace, vaddr: u64) -> KResult<()> {
    let page = align_down(vaddr, PAGE_SIZE as u64);
    let inner = ctx.0.lock();
    let vma = ctx.vma_containing(&inner, page).ok_or(KernelError::InvalidArgument)?;
    let root = inner.root;
    if paging::translate(root, page).is_some() {
        return Ok(());
    }
    let new_addr = crate::memory::pfa::alloc_frames(1).ok_or(KernelError::OutOfMemory)?;
    unsafe { core::ptr::write_bytes((KERNEL_BASE + new_addr) as *mut u8, 0, PAGE_SIZE) };
    frame_table::set_initial(new_addr);
    paging::map(root, page, new_addr, vma.prot, false)?;
    Ok(())
}

/// Entry point forwarded by `platform::on_page_fault`. Resolves the faulting
/// task's address space itself since the external page-fault contract
/// carries no context handle.
pub fn handle_page_fault(fault_vaddr: u64, err: PageFaultErrorCode, from_user: bool) -> KResult<()> {
    let ctx = match crate::sched::task::current_address_space() {
        Some(ctx) => ctx,
        None => return escalate(from_user, "page fault with no running address space"),
    };
    handle_page_fault_in(&ctx, fault_vaddr, err, from_user)
}

fn handle_page_fault_in(ctx: &AddressSpace, fault_vaddr: u64, err: PageFaultErrorCode, from_user: bool) -> KResult<()> {
    let page = align_down(fault_vaddr, PAGE_SIZE as u64);
    let mut inner = ctx.0.lock();

    let vma = match ctx.vma_containing(&inner, page) {
        Some(v) => v,
        None => return escalate(from_user, "fault address outside any VMA"),
    };

    let wants_write = err.write;
    let wants_exec = err.instr_fetch;
    let allowed = (!wants_write || vma.prot.write()) && (!wants_exec || vma.prot.exec()) && vma.prot.read();
    if !allowed {
        return escalate(from_user, "fault violates VMA protection");
    }

    let root = inner.root;
    let existing = paging::translate(root, page);

    if let Some(paddr) = existing {
        if wants_write && vma.kind.is_private() {
            // COW fault: this page is present but read-only-shared.
            let old_frame = Frame::containing(paddr);
            let new_addr = match crate::memory::pfa::alloc_frames(1) {
                Some(a) => a,
                None => return escalate(from_user, "out of memory on COW fault"),
            };
            unsafe {
                core::ptr::copy_nonoverlapping(
                    (KERNEL_BASE + paddr) as *const u8,
                    (KERNEL_BASE + new_addr) as *mut u8,
                    PAGE_SIZE,
                );
            }
            frame_table::set_initial(new_addr);
            paging::map(root, page, new_addr, vma.prot, from_user)?;
            if frame_table::dec(old_frame.start_address()) {
                crate::memory::pfa::free_frames(old_frame.start_address(), 1);
            }
            return Ok(());
        }
        // Present and the access is allowed: nothing to resolve (stale fault
        // re-delivered, or a reserved/accessed-bit condition the core does
        // not model further).
        return Ok(());
    }

    // Not present: first touch.
    match vma.kind.file_backing() {
        Some((file, base_offset)) => {
            let new_addr = match crate::memory::pfa::alloc_frames(1) {
                Some(a) => a,
                None => return escalate(from_user, "out of memory on file-backed fault"),
            };
            // A file shorter than one page leaves the tail of this frame
            // untouched by the VFS collaborator below; zero it first so that
            // tail never exposes whatever the frame held before this alloc.
            #[cfg(feature = "page-zero")]
            unsafe {
                core::ptr::write_bytes((KERNEL_BASE + new_addr) as *mut u8, 0, PAGE_SIZE)
            };
            let page_offset = base_offset + (page - vma.start);
            if crate::platform::read_file_page(file, page_offset, new_addr).is_err() {
                crate::memory::pfa::free_frames(new_addr, 1);
                return escalate(from_user, "VFS collaborator failed to page in file content");
            }
            frame_table::set_initial(new_addr);
            paging::map(root, page, new_addr, vma.prot, from_user)?;
        }
        None => {
            let new_addr = match crate::memory::pfa::alloc_frames(1) {
                Some(a) => a,
                None => return escalate(from_user, "out of memory on anonymous fault"),
            };
            unsafe { core::ptr::write_bytes((KERNEL_BASE + new_addr) as *mut u8, 0, PAGE_SIZE) };
            frame_table::set_initial(new_addr);
            paging::map(root, page, new_addr, vma.prot, from_user)?;
        }
    }
    let _ = &mut inner;
    Ok(())
}

/// Kernel faults that cannot be resolved are a programming error: panic.
/// User faults are a placeholder-terminated task (no user mode is actually
/// wired up yet, per §1 non-goals, but the policy is implemented so a future
/// ring-3 caller has somewhere to land).
fn escalate(from_user: bool, reason: &'static str) -> KResult<()> {
    if from_user {
        crate::log::log_err("vmm: terminating user task after unresolved fault");
        crate::sched::terminate_current_with_reason(reason);
    } else {
        crate::corrupted!(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_gap_skips_occupied_ranges() {
        let vmas = [
            Vma { start: 0x1000, end: 0x2000, prot: Prot::RW, kind: MappingKind::PrivateAnon, refcount: 1 },
            Vma { start: 0x2000, end: 0x4000, prot: Prot::RW, kind: MappingKind::PrivateAnon, refcount: 1 },
        ];
        let gap = find_gap(&vmas, 0x1000, 0x1000).unwrap();
        assert_eq!(gap, 0x4000);
    }

    #[test]
    fn find_gap_fits_before_first_vma() {
        let vmas = [Vma { start: 0x5000, end: 0x6000, prot: Prot::RW, kind: MappingKind::PrivateAnon, refcount: 1 }];
        let gap = find_gap(&vmas, 0x1000, 0x1000).unwrap();
        assert_eq!(gap, 0x1000);
    }

    #[test]
    fn insert_sorted_keeps_order() {
        let mut vmas = Vec::new();
        insert_sorted(&mut vmas, Vma { start: 0x3000, end: 0x4000, prot: Prot::RW, kind: MappingKind::PrivateAnon, refcount: 1 });
        insert_sorted(&mut vmas, Vma { start: 0x1000, end: 0x2000, prot: Prot::RW, kind: MappingKind::PrivateAnon, refcount: 1 });
        assert_eq!(vmas[0].start, 0x1000);
        assert_eq!(vmas[1].start, 0x3000);
    }
}
