//! Minimal CPU-services shim: the mechanical x86-64 instructions PTW/SCH
//! correctness depends on (TLB flush, halt, IRQ mask, per-CPU identity).
//!
//! GDT/IDT/PIC/APIC programming stays with the boot shim (out of scope for
//! this crate); this module only wraps instructions the core itself
//! must issue. Per-CPU identity is read out of a `gs:0`-anchored block
//! (`asm!("mov {}, gs:0", ...)`) rather than assuming a single BSP, so
//! `current_cpu_id`/`init_this_cpu` work the same on the boot processor and
//! every application processor.

use x86_64::registers::model_specific::Msr;
use x86_64::VirtAddr;

/// `IA32_GS_BASE`. The boot shim points this at a small per-CPU block whose
/// first 8 bytes hold the CPU's logical id; everything past that is the
/// collaborator's business.
const IA32_GS_BASE: u32 = 0xC000_0101;

/// Called once per CPU (BSP and each AP) by the boot shim before the core's
/// scheduler touches that CPU. `percpu_block` must stay valid for the life of
/// the CPU and must have `id` as its first 8 bytes.
///
/// # Safety
/// Caller must ensure `percpu_block` is a valid, uniquely-owned pointer and
/// that this runs before any interrupt that reads `gs:0` on this CPU.
pub unsafe fn init_this_cpu(percpu_block: *mut u8) {
    Msr::new(IA32_GS_BASE).write(percpu_block as u64);
}

/// Reads the calling CPU's logical id out of its per-CPU block. Returns `0`
/// (the BSP) if `init_this_cpu` was never called — the common case in
/// single-CPU test and bring-up configurations.
#[inline]
pub fn current_cpu_id() -> usize {
    let gs_ptr: u64;
    unsafe {
        core::arch::asm!("mov {}, gs:0", out(reg) gs_ptr, options(nostack, preserves_flags));
    }
    if gs_ptr == 0 {
        0
    } else {
        unsafe { *(gs_ptr as *const u64) as usize }
    }
}

/// Flushes a single TLB entry. The core's own TLB-shootdown discipline (§5)
/// is built out of repeated calls to this on every affected CPU; broadcasting
/// it to CPUs other than the caller is the boot shim's IPI mechanism, not the
/// core's concern.
#[inline]
pub fn invlpg(vaddr: u64) {
    x86_64::instructions::tlb::flush(VirtAddr::new(vaddr));
}

/// Disables maskable interrupts on the calling CPU.
#[inline]
pub fn disable_irq() {
    x86_64::instructions::interrupts::disable();
}

/// Enables maskable interrupts on the calling CPU.
#[inline]
pub fn enable_irq() {
    x86_64::instructions::interrupts::enable();
}

/// Halts the calling CPU until the next interrupt.
#[inline]
pub fn halt() {
    x86_64::instructions::hlt();
}
