//! Task control blocks: identity, state, accounting, and the stack/address-
//! space resources a task owns.
//!
//! `TaskId` is a strong newtype folded from a monotonic counter; `Priority`
//! is a 5-level enum; `Affinity` is a bitmask defaulting to `ANY`. The
//! global `TASKS` registry is a bounded `heapless::FnvIndexMap` of
//! `TaskId -> NonNull<Task>`, so the scheduler can obtain a task's
//! `&mut Context` without holding the table lock across the actual stack
//! swap. State is the four-value machine
//! (ready/running/blocked/terminated); a task's stack is allocated as a
//! private-anonymous VMA inside its own `memory::vmm::AddressSpace`, so it
//! participates in `fork`'s copy-on-write exactly like any other private
//! mapping, per §4.E's fork contract.

#![allow(clippy::too_many_arguments)]

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::{KResult, KernelError};
use crate::memory::layout::PAGE_SIZE;
use crate::memory::pte::Prot;
use crate::memory::vmm::{AddressSpace, MmapFlags};
use crate::sched::ctx::{init_context, Context, EntryFn};
use crate::sched::runqueue;

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TaskId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Realtime = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Idle = 4,
}

/// Priority values at or below this are classified `realtime` regardless of
/// their counters (§4.F's "priority ≤ realtime-max").
const REALTIME_MAX: Priority = Priority::Realtime;

bitflags::bitflags! {
    pub struct Affinity: u64 {
        const ANY = u64::MAX;
    }
}

impl Affinity {
    #[inline]
    pub fn allows(self, cpu: usize) -> bool {
        cpu < 64 && self.bits() & (1u64 << cpu) != 0
    }

    #[inline]
    pub const fn single(cpu: usize) -> Self {
        Affinity::from_bits_truncate(1u64 << cpu)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Terminated = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkloadClass {
    Interactive = 0,
    Compute = 1,
    Io = 2,
    Realtime = 3,
}

impl WorkloadClass {
    /// §4.F's quantum table.
    pub fn quantum_ticks(self) -> u32 {
        match self {
            WorkloadClass::Realtime => 2,
            WorkloadClass::Interactive => 5,
            WorkloadClass::Io => 10,
            WorkloadClass::Compute => 20,
        }
    }
}

/// §4.F's workload-classification formula, recomputed when a task's slice
/// expires.
pub fn classify_workload(priority: Priority, cpu_time: u64, io_wait_time: u64, voluntary_yields: u32) -> WorkloadClass {
    if priority <= REALTIME_MAX {
        return WorkloadClass::Realtime;
    }
    let total = cpu_time + io_wait_time;
    if total == 0 {
        return WorkloadClass::Interactive;
    }
    if io_wait_time * 2 > total {
        return WorkloadClass::Io;
    }
    if cpu_time * 5 > total * 4 {
        return WorkloadClass::Compute;
    }
    if voluntary_yields > 10 {
        return WorkloadClass::Interactive;
    }
    WorkloadClass::Interactive
}

pub struct Task {
    pub id: TaskId,
    pub priority: Priority,
    pub affinity: Affinity,
    state: AtomicU8,
    workload: AtomicU8,

    pub ctx: Context,
    stack_start: u64,
    stack_end: u64,

    pub address_space: AddressSpace,

    pub quantum: AtomicU32,
    pub ticks_remaining: AtomicU32,
    pub cpu_time: AtomicU64,
    pub io_wait_time: AtomicU64,
    pub voluntary_yields: AtomicU32,
    pub last_cpu: AtomicUsize,
    pub sleep_until_tick: AtomicU64,

    exit_reason: Mutex<Option<&'static str>>,
}

impl Task {
    #[inline]
    pub fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Ready,
            1 => State::Running,
            2 => State::Blocked,
            _ => State::Terminated,
        }
    }

    #[inline]
    pub fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    #[inline]
    pub fn workload(&self) -> WorkloadClass {
        match self.workload.load(Ordering::Relaxed) {
            1 => WorkloadClass::Compute,
            2 => WorkloadClass::Io,
            3 => WorkloadClass::Realtime,
            _ => WorkloadClass::Interactive,
        }
    }

    #[inline]
    pub fn set_workload(&self, w: WorkloadClass) {
        self.workload.store(w as u8, Ordering::Relaxed);
    }

    pub fn exit_reason(&self) -> Option<&'static str> {
        *self.exit_reason.lock()
    }

    pub fn set_exit_reason(&self, reason: &'static str) {
        *self.exit_reason.lock() = Some(reason);
    }
}

const MAX_TASKS: usize = 4096;
static TASKS: Mutex<heapless::FnvIndexMap<TaskId, NonNull<Task>, MAX_TASKS>> = Mutex::new(heapless::FnvIndexMap::new());
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn alloc_tid() -> TaskId {
    TaskId(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

/// The current CPU's running task, tracked by `runqueue`. `None` only
/// before `sched::init` has spawned the idle task.
pub fn current() -> Option<TaskId> {
    runqueue::running(crate::platform::cpu::current_cpu_id())
}

pub fn get(tid: TaskId) -> Option<&'static Task> {
    let tab = TASKS.lock();
    tab.get(&tid).map(|p| unsafe { &*p.as_ptr() })
}

/// Obtains a raw pointer to the task without holding `TASKS`'s lock, so a
/// caller can reach into `&mut Context` for a context switch without
/// holding the table lock across the stack swap.
pub(crate) fn get_raw(tid: TaskId) -> Option<NonNull<Task>> {
    let tab = TASKS.lock();
    tab.get(&tid).copied()
}

pub fn current_address_space() -> Option<AddressSpace> {
    let tid = current()?;
    get(tid).map(|t| t.address_space.clone())
}

/// Allocates a stack as one private-anonymous VMA inside `space`, eagerly
/// faulting in every page (a stack cannot tolerate the ordinary first-touch
/// page fault before any trap handling is viable). Leaves one guard page
/// below it unmapped.
fn alloc_stack(space: &AddressSpace, stack_size: usize) -> KResult<(u64, u64)> {
    let pages = ((stack_size + PAGE_SIZE - 1) / PAGE_SIZE).max(1);
    let total_len = ((pages + 1) * PAGE_SIZE) as u64; // + 1 guard page
    let base = space.mmap(None, total_len, Prot::RW, MmapFlags::PRIVATE | MmapFlags::ANONYMOUS, None)?;
    let stack_start = base + PAGE_SIZE as u64; // skip the guard page
    let stack_end = stack_start + (pages * PAGE_SIZE) as u64;

    let mut va = stack_start;
    while va < stack_end {
        crate::memory::vmm::populate(space, va)?;
        va += PAGE_SIZE as u64;
    }
    Ok((stack_start, stack_end))
}

fn free_stack(space: &AddressSpace, stack_start: u64, stack_end: u64) {
    let guard_base = stack_start - PAGE_SIZE as u64;
    let _ = space.munmap(guard_base, stack_end - guard_base);
}

/// Spawns a new task. `inherit_address_space` selects between a
/// fresh, empty address space and sharing the caller's current one (the two
/// readings of "fresh or inherited"); `fork_current` below is the third,
/// COW-cloning path.
pub fn spawn(
    entry: EntryFn,
    arg: usize,
    stack_size: usize,
    priority: Priority,
    affinity: Affinity,
    inherit_address_space: bool,
) -> KResult<TaskId> {
    let space = if inherit_address_space {
        current_address_space().ok_or(KernelError::InvalidArgument)?
    } else {
        AddressSpace::new()?
    };

    let (stack_start, stack_end) = alloc_stack(&space, stack_size)?;

    let id = alloc_tid();
    let mut ctx = Context::new();
    unsafe {
        init_context(&mut ctx, stack_end, entry, arg, task_exit_trampoline);
    }

    let task = Task {
        id,
        priority,
        affinity,
        state: AtomicU8::new(State::Ready as u8),
        workload: AtomicU8::new(WorkloadClass::Interactive as u8),
        ctx,
        stack_start,
        stack_end,
        address_space: space,
        quantum: AtomicU32::new(WorkloadClass::Interactive.quantum_ticks()),
        ticks_remaining: AtomicU32::new(WorkloadClass::Interactive.quantum_ticks()),
        cpu_time: AtomicU64::new(0),
        io_wait_time: AtomicU64::new(0),
        voluntary_yields: AtomicU32::new(0),
        last_cpu: AtomicUsize::new(usize::MAX),
        sleep_until_tick: AtomicU64::new(0),
        exit_reason: Mutex::new(None),
    };

    let leaked: &'static mut Task = alloc::boxed::Box::leak(alloc::boxed::Box::new(task));
    let ptr = NonNull::from(&mut *leaked);

    {
        let mut tab = TASKS.lock();
        if tab.insert(id, ptr).is_err() {
            return Err(KernelError::Exhausted);
        }
    }

    let cpu = choose_cpu(affinity);
    leaked.last_cpu.store(cpu, Ordering::Relaxed);
    runqueue::push_back(cpu, id);
    crate::log::log_info("task: spawned");
    Ok(id)
}

fn choose_cpu(affinity: Affinity) -> usize {
    let mut best_cpu = 0usize;
    let mut best_load = usize::MAX;
    for cpu in 0..crate::memory::layout::MAX_CPUS {
        if !affinity.allows(cpu) {
            continue;
        }
        let load = runqueue::load(cpu);
        if load < best_load {
            best_load = load;
            best_cpu = cpu;
        }
    }
    best_cpu
}

#[no_mangle]
pub extern "C" fn task_exit_trampoline() -> ! {
    crate::sched::terminate_current()
}

/// Reclaims `tid`'s stack, address space handle, and TCB. Called by the
/// per-CPU reaper once the scheduler has switched off a terminated task —
/// never call this on the currently running task.
pub(crate) fn reap(tid: TaskId) {
    let boxed = {
        let mut tab = TASKS.lock();
        tab.remove(&tid)
    };
    if let Some(ptr) = boxed {
        let task = unsafe { &*ptr.as_ptr() };
        free_stack(&task.address_space, task.stack_start, task.stack_end);
        unsafe { drop(alloc::boxed::Box::from_raw(ptr.as_ptr())) };
    }
}

pub fn set_priority(tid: TaskId, priority: Priority) {
    if let Some(t) = get(tid) {
        unsafe { (*(t as *const Task as *mut Task)).priority = priority };
    }
}

pub fn set_affinity(tid: TaskId, affinity: Affinity) {
    if let Some(t) = get(tid) {
        unsafe { (*(t as *const Task as *mut Task)).affinity = affinity };
    }
}

extern "C" {
    fn __kcore_fork_snapshot() -> u64;
}

#[no_mangle]
extern "C" fn __kcore_fork_continue(snapshot_rsp: u64) -> u64 {
    match fork_continue(snapshot_rsp) {
        Ok(child_id) => child_id.0,
        Err(_) => u64::MAX,
    }
}

fn fork_continue(snapshot_rsp: u64) -> KResult<TaskId> {
    let parent_tid = current().ok_or(KernelError::InvalidArgument)?;
    let parent = get(parent_tid).ok_or(KernelError::InvalidArgument)?;

    let child_space = parent.address_space.fork()?;
    let id = alloc_tid();

    let mut ctx = Context::new();
    unsafe { crate::sched::ctx::set_rsp(&mut ctx, snapshot_rsp) };

    let task = Task {
        id,
        priority: parent.priority,
        affinity: parent.affinity,
        state: AtomicU8::new(State::Ready as u8),
        workload: AtomicU8::new(parent.workload() as u8),
        ctx,
        stack_start: parent.stack_start,
        stack_end: parent.stack_end,
        address_space: child_space,
        quantum: AtomicU32::new(parent.quantum.load(Ordering::Relaxed)),
        ticks_remaining: AtomicU32::new(parent.quantum.load(Ordering::Relaxed)),
        cpu_time: AtomicU64::new(0),
        io_wait_time: AtomicU64::new(0),
        voluntary_yields: AtomicU32::new(0),
        last_cpu: AtomicUsize::new(usize::MAX),
        sleep_until_tick: AtomicU64::new(0),
        exit_reason: Mutex::new(None),
    };

    let leaked: &'static mut Task = alloc::boxed::Box::leak(alloc::boxed::Box::new(task));
    let ptr = NonNull::from(&mut *leaked);
    {
        let mut tab = TASKS.lock();
        if tab.insert(id, ptr).is_err() {
            return Err(KernelError::Exhausted);
        }
    }
    let cpu = choose_cpu(leaked.affinity);
    leaked.last_cpu.store(cpu, Ordering::Relaxed);
    runqueue::push_back(cpu, id);
    Ok(id)
}

/// Forks the calling task. Returns `TaskId(0)` in the child
/// (never a real allocated ID — `alloc_tid` starts at 1) and the child's
/// real ID in the parent, mirroring the classic `fork()` return convention.
pub fn fork_current() -> KResult<TaskId> {
    let rax = unsafe { __kcore_fork_snapshot() };
    if rax == u64::MAX {
        Err(KernelError::OutOfMemory)
    } else {
        Ok(TaskId(rax))
    }
}

pub fn is_fork_child(result: TaskId) -> bool {
    result.0 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_priority_always_classifies_realtime() {
        assert_eq!(classify_workload(Priority::Realtime, 0, 0, 0), WorkloadClass::Realtime);
        assert_eq!(classify_workload(Priority::Realtime, 1000, 1000, 50), WorkloadClass::Realtime);
    }

    #[test]
    fn fresh_task_with_no_accounting_is_interactive() {
        assert_eq!(classify_workload(Priority::Normal, 0, 0, 0), WorkloadClass::Interactive);
    }

    #[test]
    fn io_heavy_ratio_classifies_io() {
        // io_wait * 2 > total ⇒ io-bound.
        assert_eq!(classify_workload(Priority::Normal, 10, 30, 0), WorkloadClass::Io);
    }

    #[test]
    fn cpu_heavy_ratio_classifies_compute() {
        // cpu_time * 5 > total * 4 ⇒ compute-bound (cpu_time is >80% of total).
        assert_eq!(classify_workload(Priority::Normal, 90, 10, 0), WorkloadClass::Compute);
    }

    #[test]
    fn frequent_yielder_classifies_interactive() {
        // Balanced cpu/io mix, but enough voluntary yields to mark it interactive.
        assert_eq!(classify_workload(Priority::Normal, 50, 50, 11), WorkloadClass::Interactive);
    }

    #[test]
    fn quantum_table_matches_workload_class() {
        assert_eq!(WorkloadClass::Realtime.quantum_ticks(), 2);
        assert_eq!(WorkloadClass::Interactive.quantum_ticks(), 5);
        assert_eq!(WorkloadClass::Io.quantum_ticks(), 10);
        assert_eq!(WorkloadClass::Compute.quantum_ticks(), 20);
    }

    #[test]
    fn affinity_single_allows_only_that_cpu() {
        let a = Affinity::single(3);
        assert!(a.allows(3));
        assert!(!a.allows(0));
        assert!(!a.allows(63));
    }

    #[test]
    fn affinity_any_allows_every_cpu_below_64() {
        assert!(Affinity::ANY.allows(0));
        assert!(Affinity::ANY.allows(63));
    }

    #[test]
    fn affinity_rejects_cpu_ids_at_or_past_64() {
        // The bitmask is 64 bits wide; `allows` must not panic on a shift
        // past its width, and must treat such CPU ids as disallowed.
        assert!(!Affinity::ANY.allows(64));
    }
}
