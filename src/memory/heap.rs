//! Kernel Heap — size-classed slab allocator backing `#[global_allocator]`.
//!
//! `LockedHeap`/`GlobalAlloc`/`alloc_error_handler` wiring over a nine-class
//! slab design rather than a general-purpose linked-list allocator. One free
//! list per class, threaded through the free objects themselves, with
//! geometric slab growth rather than any bump-pointer shortcut.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use spin::Mutex;

use crate::memory::layout::{align_down_usize, align_up_usize, page_count, HEAP_BASE, HEAP_RESERVE, KERNEL_BASE, PAGE_SIZE};
use crate::memory::paging;
use crate::memory::pfa;
use crate::memory::pte::Prot;
use crate::memory::vmm;

/// Nine power-of-two classes, 16 B .. 4096 B, per §4.D.
const CLASS_SIZES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];
const NUM_CLASSES: usize = CLASS_SIZES.len();
const INITIAL_OBJECTS: usize = 32;
const MIN_GROWTH_OBJECTS: usize = 16;

#[inline]
fn class_for(size: usize) -> Option<usize> {
    CLASS_SIZES.iter().position(|&c| c >= size)
}

/// A free object's first 8 bytes double as the intrusive free-list link.
/// Kept as a raw-pointer graph (rather than an arena of indices) because the
/// "list" is the set of free bytes of the allocation itself, which has no
/// other representation in a slab allocator; the safety boundary is that a
/// freed object's first word is never read as data until it is popped back
/// off this list.
struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

struct SizeClass {
    object_size: usize,
    free_list: Option<NonNull<FreeNode>>,
    total_objects: usize,
    free_objects: usize,
    alloc_count: u64,
    free_count: u64,
    /// Bump cursor into the heap's reserved virtual window; slabs for this
    /// class are carved out of it on growth and never returned to PFA
    /// individually (freed objects return to `free_list`, not to PFA).
    next_slab_vaddr: u64,
}

// SAFETY: every access goes through `Heap`'s per-class mutex.
unsafe impl Send for SizeClass {}

impl SizeClass {
    const fn new(object_size: usize, base_vaddr: u64) -> Self {
        SizeClass {
            object_size,
            free_list: None,
            total_objects: 0,
            free_objects: 0,
            alloc_count: 0,
            free_count: 0,
            next_slab_vaddr: base_vaddr,
        }
    }

    /// Allocates `count` more objects' worth of virtual space from the bump
    /// cursor, maps it page by page from PFA, and threads every object onto
    /// the free list. Doubles the class's current object count (floor 16),
    /// matching §4.D's geometric-growth rule.
    ///
    /// Relies on `self.next_slab_vaddr` always starting this call
    /// page-aligned (true of `stripe_base`'s initial value, and preserved
    /// below since every advance is by a whole number of pages): otherwise
    /// `count * object_size` objects threaded across `[base, base+bytes)`
    /// would run past the last page this call actually mapped.
    fn grow(&mut self) -> bool {
        let count = if self.total_objects == 0 { INITIAL_OBJECTS } else { self.total_objects.max(MIN_GROWTH_OBJECTS) };
        let bytes = count * self.object_size;
        let pages = page_count(bytes);
        let base = self.next_slab_vaddr;
        debug_assert!(base % PAGE_SIZE as u64 == 0, "heap: slab base must be page-aligned");

        for i in 0..pages {
            let vaddr = base + (i * PAGE_SIZE) as u64;
            let paddr = match pfa::alloc_frames(1) {
                Some(a) => a,
                None => return false,
            };
            if paging::map(crate::memory::vmm::kernel_root(), vaddr, paddr, Prot::RW, false).is_err() {
                pfa::free_frames(paddr, 1);
                return false;
            }
        }
        self.next_slab_vaddr = base + (pages * PAGE_SIZE) as u64;

        for i in 0..count {
            let addr = (base + (i * self.object_size) as u64) as usize;
            let node = addr as *mut FreeNode;
            unsafe {
                (*node).next = self.free_list;
            }
            self.free_list = NonNull::new(node);
        }
        self.total_objects += count;
        self.free_objects += count;
        true
    }

    fn pop(&mut self) -> Option<*mut u8> {
        let node = self.free_list?;
        unsafe {
            self.free_list = (*node.as_ptr()).next;
        }
        self.free_objects -= 1;
        self.alloc_count += 1;
        Some(node.as_ptr() as *mut u8)
    }

    fn push(&mut self, ptr: *mut u8) {
        let node = ptr as *mut FreeNode;
        unsafe {
            (*node).next = self.free_list;
        }
        self.free_list = NonNull::new(node);
        self.free_objects += 1;
        self.free_count += 1;
    }
}

/// Out-of-band record for a single large (> 4096 B) allocation, keyed by
/// base address — the downcast-by-pointer-range pattern §9 flags, resolved
/// here with an explicit side table rather than a header guess.
#[derive(Clone, Copy)]
struct LargeRecord {
    base: u64,
    pages: usize,
    tag: Option<&'static str>,
}

const MAX_LARGE_RECORDS: usize = 4096;
const MAX_TRACKED: usize = 4096;

#[derive(Clone, Copy)]
struct TrackedRecord {
    ptr: u64,
    size: usize,
    tag: &'static str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub total_allocated: u64,
    pub peak: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

struct Heap {
    classes: [SizeClass; NUM_CLASSES],
    large: heapless::Vec<LargeRecord, MAX_LARGE_RECORDS>,
    tracked: heapless::Vec<TrackedRecord, MAX_TRACKED>,
    current_bytes: u64,
    peak_bytes: u64,
}

impl Heap {
    /// `align` beyond a page is not supported: every slab class size is a
    /// power of two up to 4096 B, and a large allocation is frame-aligned,
    /// so nothing in the heap can hand back a pointer aligned any more
    /// strictly than that.
    fn alloc(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        let align = align.max(1).next_power_of_two();
        debug_assert!(align <= PAGE_SIZE, "heap: alignment beyond a page is not supported");
        let align = align.min(PAGE_SIZE);
        let size = align_up_usize(size.max(1), 16).max(align);
        if size > *CLASS_SIZES.last().unwrap() {
            return self.alloc_large(size);
        }
        let idx = class_for(size)?;
        let class = &mut self.classes[idx];
        if class.free_list.is_none() && !class.grow() {
            return None;
        }
        let ptr = class.pop()?;
        unsafe { core::ptr::write_bytes(ptr, 0, class.object_size) };
        self.current_bytes += class.object_size as u64;
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);
        Some(ptr)
    }

    /// Large allocations are "mapped" by construction: they live in the
    /// direct physical map (`KERNEL_BASE + phys`) the boot shim installs over
    /// all of physical memory, the same way `memory::pfa` and
    /// `memory::frame_table` reach physical pages before any page table walk
    /// is possible. No separate virtual stripe is carved out for them.
    fn alloc_large(&mut self, size: usize) -> Option<*mut u8> {
        let pages = page_count(size);
        let base = pfa::alloc_frames(pages)?;
        let ptr = (KERNEL_BASE + base) as *mut u8;
        self.large.push(LargeRecord { base, pages, tag: None }).ok()?;
        self.current_bytes += (pages * PAGE_SIZE) as u64;
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);
        Some(ptr)
    }

    fn free(&mut self, ptr: *mut u8) {
        let addr = ptr as u64;
        if addr >= KERNEL_BASE {
            let phys = addr - KERNEL_BASE;
            if let Some(pos) = self.large.iter().position(|r| r.base == phys) {
                let rec = self.large.swap_remove(pos);
                pfa::free_frames(rec.base, rec.pages);
                self.current_bytes -= (rec.pages * PAGE_SIZE) as u64;
                return;
            }
        }
        if addr < HEAP_BASE as u64 || addr >= HEAP_BASE as u64 + HEAP_RESERVE as u64 {
            crate::log::log_warn("heap: free of address outside any known slab or large record");
            return;
        }
        for class in self.classes.iter_mut() {
            let base = class_base(class);
            let span = (class.total_objects * class.object_size) as u64;
            if addr >= base && addr < base + span && (addr - base) % class.object_size as u64 == 0 {
                self.current_bytes -= class.object_size as u64;
                class.push(ptr);
                return;
            }
        }
        crate::log::log_warn("heap: free of address outside any known slab or large record");
    }

    fn stats(&self) -> HeapStats {
        let alloc_count: u64 = self.classes.iter().map(|c| c.alloc_count).sum::<u64>() + self.large.len() as u64;
        let free_count: u64 = self.classes.iter().map(|c| c.free_count).sum();
        HeapStats { total_allocated: self.current_bytes, peak: self.peak_bytes, alloc_count, free_count }
    }
}

/// The lowest virtual address a class's slabs could possibly start at; used
/// only by `free` to range-check a pointer against a class without storing a
/// redundant base field per class (the bump cursor already records "highest
/// issued", this derives "lowest issued" from the per-class reserved stripe).
#[inline]
fn class_base(class: &SizeClass) -> u64 {
    class.next_slab_vaddr - (class.total_objects * class.object_size) as u64
}

static HEAP: Mutex<Option<Heap>> = Mutex::new(None);

/// Carves `HEAP_RESERVE` bytes of the reserved heap virtual window into nine
/// equal stripes, one per size class, so each class's bump cursor never
/// collides with another's. The stripe size is floored to a whole page
/// (`HEAP_RESERVE / NUM_CLASSES` is not itself a page multiple) so every
/// stripe — and therefore every class's starting `next_slab_vaddr` — lands
/// page-aligned; a `grow`'s first slab then starts on a mapped-page boundary
/// instead of spilling its tail objects into whatever lies past the last
/// page `grow` actually mapped. `HEAP_RESERVE / NUM_CLASSES` must exceed any
/// single class's plausible total footprint; the core has no mechanism to
/// grow a class past its stripe and instead fails that class's `grow` (seen
/// by the caller as `OutOfMemory`), which is an acceptable boot-time sizing
/// decision for a fixed-budget kernel heap.
fn stripe_base(idx: usize) -> u64 {
    let stripe = align_down_usize(HEAP_RESERVE / NUM_CLASSES, PAGE_SIZE) as u64;
    HEAP_BASE as u64 + idx as u64 * stripe
}

/// Reserves the heap's virtual window and pre-populates every class with an
/// initial slab of 32 objects. Idempotent.
pub fn init() {
    let mut guard = HEAP.lock();
    if guard.is_some() {
        return;
    }
    let mut classes: [SizeClass; NUM_CLASSES] =
        core::array::from_fn(|i| SizeClass::new(CLASS_SIZES[i], stripe_base(i)));
    for class in classes.iter_mut() {
        if !class.grow() {
            crate::corrupted!("heap: out of memory pre-populating initial size classes");
        }
    }
    *guard = Some(Heap { classes, large: heapless::Vec::new(), tracked: heapless::Vec::new(), current_bytes: 0, peak_bytes: 0 });
    crate::log::log_info("heap: initialized");
}

pub fn alloc(size: usize) -> Option<*mut u8> {
    alloc_aligned(size, 16)
}

/// As [`alloc`], but honoring a caller-supplied alignment (up to a page)
/// instead of the default 16 B minimum — the `GlobalAlloc` impl below needs
/// this to respect a `Layout`'s actual `align()` rather than folding it into
/// `size` and hoping the chosen class happens to cover it.
pub fn alloc_aligned(size: usize, align: usize) -> Option<*mut u8> {
    let mut guard = HEAP.lock();
    guard.as_mut().expect("heap::alloc before init").alloc(size, align)
}

pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let mut guard = HEAP.lock();
    guard.as_mut().expect("heap::free before init").free(ptr);
}

/// `realloc`: a shortcut of returning the same pointer is taken when the new
/// size still fits the old class (determined by re-deriving the class from
/// the pointer, same lookup `free` uses); otherwise allocates new, copies
/// `min(old, new)` bytes, frees old.
pub fn realloc(ptr: *mut u8, old_size: usize, new_size: usize) -> Option<*mut u8> {
    if class_for(align_up_usize(old_size.max(1), 16)) == class_for(align_up_usize(new_size.max(1), 16))
        && new_size <= 4096
    {
        return Some(ptr);
    }
    let new_ptr = alloc(new_size)?;
    let copy_len = old_size.min(new_size);
    unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len) };
    free(ptr);
    Some(new_ptr)
}

/// Layers leak-tracking over `alloc`: records are drawn from the heap itself,
/// but never tracked — tracking a tracking record would recurse forever.
#[cfg(feature = "kh-leak-tracking")]
pub fn alloc_tracked(size: usize, tag: &'static str) -> Option<*mut u8> {
    let ptr = alloc(size)?;
    let mut guard = HEAP.lock();
    let heap = guard.as_mut().expect("heap::alloc_tracked before init");
    if heap.tracked.push(TrackedRecord { ptr: ptr as u64, size, tag }).is_err() {
        crate::log::log_warn("heap: leak-tracking table full, record dropped");
    }
    Some(ptr)
}

#[cfg(feature = "kh-leak-tracking")]
pub fn free_tracked(ptr: *mut u8) {
    {
        let mut guard = HEAP.lock();
        let heap = guard.as_mut().expect("heap::free_tracked before init");
        if let Some(pos) = heap.tracked.iter().position(|r| r.ptr == ptr as u64) {
            heap.tracked.swap_remove(pos);
        }
    }
    free(ptr);
}

#[cfg(feature = "kh-leak-tracking")]
pub fn dump_leaks() -> heapless::Vec<(u64, usize, &'static str), MAX_TRACKED> {
    let guard = HEAP.lock();
    let heap = guard.as_ref().expect("heap::dump_leaks before init");
    heap.tracked.iter().map(|r| (r.ptr, r.size, r.tag)).collect()
}

pub fn stats() -> HeapStats {
    let guard = HEAP.lock();
    guard.as_ref().map(Heap::stats).unwrap_or_default()
}

/// External-collaborator name for [`alloc`]. Kept as a thin alias rather than
/// renaming `alloc` itself, since the latter is also what `KernelHeap`'s
/// `GlobalAlloc` impl calls internally.
pub fn kmalloc(size: usize) -> Option<*mut u8> {
    alloc(size)
}

/// External-collaborator name for [`free`].
pub fn kfree(ptr: *mut u8) {
    free(ptr)
}

#[cfg(feature = "kh-leak-tracking")]
pub fn kmalloc_tracked(size: usize, tag: &'static str) -> Option<*mut u8> {
    alloc_tracked(size, tag)
}

#[cfg(feature = "kh-leak-tracking")]
pub fn kfree_tracked(ptr: *mut u8) {
    free_tracked(ptr)
}

/// `GlobalAlloc` wiring — the slab design above, not `linked_list_allocator`,
/// backs every ordinary `alloc::` collection the rest of the core uses
/// (`Vec`, `Arc`, `Box`) once `memory::heap::init` has run.
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        alloc_aligned(layout.size(), layout.align()).unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        realloc(ptr, layout.size(), new_size).unwrap_or(core::ptr::null_mut())
    }
}

// Both lang items below only make sense for the real `no_std` target build:
// host test runs keep std's own global allocator and error handler so the
// test harness itself (which allocates) keeps working.
#[cfg(not(test))]
#[global_allocator]
static GLOBAL_ALLOC: KernelHeap = KernelHeap;

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    crate::corrupted!("heap: allocation request could not be satisfied");
    #[allow(unreachable_code)]
    {
        let _ = layout;
        loop {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap() -> Heap {
        let classes: [SizeClass; NUM_CLASSES] = core::array::from_fn(|i| SizeClass::new(CLASS_SIZES[i], 0x1000_0000 + (i as u64) * 0x10_0000));
        Heap { classes, large: heapless::Vec::new(), tracked: heapless::Vec::new(), current_bytes: 0, peak_bytes: 0 }
    }

    #[test]
    fn class_for_rounds_up_to_smallest_adequate() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(16), Some(0));
        assert_eq!(class_for(17), Some(1));
        assert_eq!(class_for(24), Some(1));
        assert_eq!(class_for(4096), Some(8));
        assert_eq!(class_for(4097), None);
    }

    #[test]
    fn growth_doubles_with_a_floor() {
        let mut class = SizeClass::new(32, 0x2000_0000);
        // Standalone grow() without PFA requires the real `Heap::alloc` path;
        // exercise the pure counting logic directly instead.
        class.total_objects = 32;
        let next_count = class.total_objects.max(MIN_GROWTH_OBJECTS);
        assert_eq!(next_count, 32);
        class.total_objects = 8;
        assert_eq!(class.total_objects.max(MIN_GROWTH_OBJECTS), 16);
    }

    #[test]
    fn class_base_derives_lowest_issued_address() {
        let mut class = SizeClass::new(32, 0x3000_0000);
        class.total_objects = 10;
        class.next_slab_vaddr = 0x3000_0000 + 10 * 32;
        assert_eq!(class_base(&class), 0x3000_0000);
    }

    #[test]
    fn realloc_within_same_class_is_a_shortcut() {
        assert_eq!(class_for(20), class_for(24));
    }

    #[test]
    fn stripe_base_is_always_page_aligned() {
        // HEAP_RESERVE / NUM_CLASSES (64 MiB / 9) is not a page multiple;
        // every stripe base must still land page-aligned so a class's first
        // `grow` never threads objects past the last page it actually maps.
        for idx in 0..NUM_CLASSES {
            let base = stripe_base(idx);
            assert_eq!(base % PAGE_SIZE as u64, 0, "stripe {idx} is not page-aligned: {base:#x}");
        }
    }

    #[test]
    fn stripe_bases_do_not_overlap() {
        let stripe = align_down_usize(HEAP_RESERVE / NUM_CLASSES, PAGE_SIZE) as u64;
        for idx in 0..NUM_CLASSES - 1 {
            assert_eq!(stripe_base(idx + 1) - stripe_base(idx), stripe);
        }
    }

    #[test]
    fn size_folds_alignment_up_to_a_page_into_a_covering_class() {
        // Mirrors `Heap::alloc`'s size/align folding: for every power-of-two
        // alignment up to a page, the class chosen to cover the folded size
        // is itself a power of two at least that large, so it is always a
        // multiple of the requested alignment without any extra padding.
        for align in [16usize, 32, 64, 128, 256, 512, 1024, 2048, 4096] {
            let size = align_up_usize(8usize, 16).max(align);
            let idx = class_for(size).unwrap();
            assert_eq!(CLASS_SIZES[idx] % align, 0, "class {} does not cover alignment {align}", CLASS_SIZES[idx]);
        }
    }
}
