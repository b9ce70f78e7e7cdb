//! External-collaborator contract surface.
//!
//! The core does not do platform bring-up, but something has to be the one
//! narrow seam a boot shim, trap layer, and VFS bind to. Rather than letting
//! a raw firmware memory-descriptor type reach all the way into the frame
//! allocator, every subsystem behind this module only ever sees the
//! platform-neutral shapes declared here.

pub mod cpu;

use crate::error::KResult;
use crate::memory::frame::{BootInfo, MemoryMapEntry, RegionKind};
use crate::memory::{pfa, vmm};
use crate::sched;

pub use crate::memory::frame::BootInfo as BootMemoryMap;

/// Bits of the x86-64 page-fault error code the trap layer hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultErrorCode {
    pub present: bool,
    pub write: bool,
    pub user: bool,
    pub reserved: bool,
    pub instr_fetch: bool,
}

/// One-time handoff from the boot shim: the raw memory map plus the two
/// ranges the shim itself occupies. Fans out to every leaf subsystem that
/// needs to know about physical memory at boot.
///
/// `num_cpus` is whatever topology discovery the shim already did (ACPI/MP
/// tables) — the core has no reader of its own and treats that count as an
/// opaque input to `sched::init`.
pub fn init(boot: &BootInfo, num_cpus: usize) {
    crate::log::init_logger();
    pfa::init(boot);
    crate::memory::frame_table::init();
    crate::memory::heap::init();
    sched::init(num_cpus);
    crate::log::log_info("platform: core subsystems online");
}

/// Forwarded by the trap layer on every timer interrupt (100 Hz nominal).
/// The trap layer is responsible for calling this with IRQs already
/// disabled, matching `sched::tick`'s contract.
pub fn on_timer_tick() {
    sched::tick(cpu::current_cpu_id());
}

/// Forwarded by the trap layer on a `#PF` exception.
pub fn on_page_fault(fault_vaddr: u64, err: PageFaultErrorCode, from_user: bool) -> KResult<()> {
    vmm::handle_page_fault(fault_vaddr, err, from_user)
}

/// Signature a VFS collaborator registers to serve file-backed page faults.
/// `out_frame` is the physical address of a freshly allocated, zeroed frame
/// the VMM expects to be filled in place.
pub type FileReader = fn(file: u64, offset: u64, out_frame: u64) -> KResult<()>;

static FILE_READER: spin::Mutex<Option<FileReader>> = spin::Mutex::new(None);

/// Registers the VFS collaborator's page-in entry point. Optional: a core
/// with no file-backed mappings never calls this.
pub fn register_file_reader(reader: FileReader) {
    *FILE_READER.lock() = Some(reader);
}

pub(crate) fn read_file_page(file: u64, offset: u64, out_frame: u64) -> KResult<()> {
    match *FILE_READER.lock() {
        Some(f) => f(file, offset, out_frame),
        None => Err(crate::error::KernelError::InvalidArgument),
    }
}

/// Signature the POSIX-flavored syscall surface (out of scope) registers to
/// receive forwarded `syscall(n, args...)` traps. The core never interprets
/// `n` or `args`; it is purely a relay, consistent with §1 treating the
/// syscall surface as an external collaborator.
pub type SyscallHandler = fn(n: u64, args: [u64; 6]) -> u64;

static SYSCALL_HANDLER: spin::Mutex<Option<SyscallHandler>> = spin::Mutex::new(None);

pub fn register_syscall_handler(handler: SyscallHandler) {
    *SYSCALL_HANDLER.lock() = Some(handler);
}

/// Forwarded by the trap layer on a `syscall` trap. Returns `0` if no
/// collaborator has registered a handler.
pub fn on_syscall(n: u64, args: [u64; 6]) -> u64 {
    match *SYSCALL_HANDLER.lock() {
        Some(h) => h(n, args),
        None => 0,
    }
}

pub use RegionKind as BootRegionKind;
pub use MemoryMapEntry as BootMemoryMapEntry;

/// Gathers the exposed memory and task facades at this contract-surface
/// module, alongside the consumed hooks above, so a collaborator has one
/// place to look rather than reaching into `memory`/`sched` directly.
pub use crate::memory::heap::{kfree, kmalloc};
#[cfg(feature = "kh-leak-tracking")]
pub use crate::memory::heap::{kfree_tracked, kmalloc_tracked};
pub use crate::memory::pfa::{alloc_frames, free_frames};
pub use sched::{current_task_id, exit, kill, sleep, spawn, task_info, yield_now, TaskInfo};
