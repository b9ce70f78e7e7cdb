//! Per-CPU adaptive-quantum scheduler with pull-model work-stealing.
//!
//! Fanned out across `memory::layout::MAX_CPUS` independent run queues and
//! built around the workload-classification/adaptive-quantum rule rather
//! than a fixed timeslice. `task`/`runqueue`/`ctx` do the bookkeeping; this
//! module is purely the dispatch loop and the tick/yield/sleep/balance entry
//! points the rest of the core (and the trap layer, an external
//! collaborator) calls into.

pub mod ctx;
pub mod runqueue;
pub mod task;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::memory::layout::{MAX_CPUS, PAGE_SIZE};
use crate::sched::task::{Affinity, Priority, State, Task};

pub use task::{
    classify_workload, current, current_address_space, fork_current, is_fork_child, set_affinity, set_priority, spawn,
    current as current_task_id, Priority as TaskPriority, State as TaskState, TaskId, WorkloadClass,
};

/// Nominal timer-interrupt rate (matches `Cargo.toml`'s
/// `package.metadata.kcore.scheduler.tick_hz`); `sleep`'s millisecond
/// argument is converted against this.
const TICK_HZ: u64 = 100;

/// `0` is never a real [`TaskId`] (`task::alloc_tid` starts at 1), so it
/// doubles as "no idle task recorded yet" / "nothing pending reap".
const NONE_TID: u64 = 0;

lazy_static::lazy_static! {
    static ref IDLE_TASKS: [AtomicU64; MAX_CPUS] = core::array::from_fn(|_| AtomicU64::new(NONE_TID));
    static ref PENDING_REAP: [AtomicU64; MAX_CPUS] = core::array::from_fn(|_| AtomicU64::new(NONE_TID));
    static ref TICKS: [AtomicU64; MAX_CPUS] = core::array::from_fn(|_| AtomicU64::new(0));

    /// Tasks put to sleep by [`sleep`], parked here instead of any run queue
    /// until their wake tick arrives. Per-CPU like the run queues themselves
    /// so waking never needs to cross a lock a balance operation also holds.
    static ref SLEEPING: [Mutex<heapless::Vec<TaskId, 64>>; MAX_CPUS] =
        core::array::from_fn(|_| Mutex::new(heapless::Vec::new()));
}

/// Diagnostic snapshot of one CPU's run queue, surfaced for whatever
/// collaborator wants scheduler visibility (a `/proc`-like shell, a test).
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuStats {
    pub ready: usize,
    pub busy_ticks: u64,
    pub idle_ticks: u64,
    pub load_balances: u64,
}

pub fn stats(cpu: usize) -> CpuStats {
    runqueue::with(cpu, |q| CpuStats {
        ready: q.load(),
        busy_ticks: q.busy_ticks,
        idle_ticks: q.idle_ticks,
        load_balances: q.load_balances,
    })
}

extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        crate::platform::cpu::enable_irq();
        crate::platform::cpu::halt();
    }
}

/// Spawns one idle task per CPU and marks it as that CPU's running task.
/// Idle tasks never sit in a ready queue — `pick_next` falls back to them by
/// identity, not by FIFO order — so this removes each one immediately after
/// `task::spawn` places it. Called once by `platform::init`; `num_cpus` comes
/// from whatever topology discovery the boot shim did (an external
/// collaborator's job — the core itself has no ACPI/MP-table reader).
pub fn init(num_cpus: usize) {
    for cpu in 0..num_cpus.min(MAX_CPUS) {
        let id = task::spawn(idle_entry, 0, PAGE_SIZE * 4, Priority::Idle, Affinity::single(cpu), false)
            .unwrap_or_else(|_| crate::corrupted!("sched: failed to spawn idle task"));
        runqueue::remove(cpu, id);
        IDLE_TASKS[cpu].store(id.0, Ordering::Relaxed);
        runqueue::set_running(cpu, Some(id));
        if let Some(t) = task::get(id) {
            t.set_state(State::Running);
        }
    }
    crate::log::log_info("sched: idle tasks online");
}

fn is_idle(cpu: usize, tid: TaskId) -> bool {
    IDLE_TASKS[cpu].load(Ordering::Relaxed) == tid.0
}

/// Reclaims whatever task [`terminate_current_with_reason`] stashed before
/// switching away from it. Must only run on a CPU that has since switched to
/// a *different* task — calling this about the task presently running on
/// `cpu` would reap a live TCB.
fn reap_pending(cpu: usize) {
    let raw = PENDING_REAP[cpu].swap(NONE_TID, Ordering::AcqRel);
    if raw != NONE_TID {
        task::reap(TaskId(raw));
    }
}

/// Requeues any sleeper whose wake tick has arrived back onto `cpu`'s ready
/// queue.
fn wake_sleepers(cpu: usize) {
    let now = TICKS[cpu].load(Ordering::Relaxed);
    let mut sleeping = SLEEPING[cpu].lock();
    let mut i = 0;
    while i < sleeping.len() {
        let tid = sleeping[i];
        let due = task::get(tid).map(|t| t.sleep_until_tick.load(Ordering::Relaxed)).unwrap_or(0);
        if due <= now {
            sleeping.swap_remove(i);
            if let Some(t) = task::get(tid) {
                t.set_state(State::Ready);
            }
            runqueue::push_back(cpu, tid);
        } else {
            i += 1;
        }
    }
}

fn is_terminated(tid: TaskId) -> bool {
    task::get(tid).map(|t| t.state() == State::Terminated).unwrap_or(false)
}

/// Picks the next task to run on `cpu`: the front of its own ready queue,
/// falling back to [`balance`] stealing a runnable task from a busier peer,
/// falling back to that CPU's idle task.
fn pick_next(cpu: usize) -> TaskId {
    loop {
        if let Some(tid) = runqueue::pop_front(cpu) {
            // `kill` on a task still sitting in a ready queue marks it
            // Terminated in place rather than risk removing it out from
            // under a concurrent pop; a task found this way is reaped
            // immediately and never handed back as `next`.
            if is_terminated(tid) {
                task::reap(tid);
                continue;
            }
            return tid;
        }
        if cfg!(feature = "sched-work-stealing") && balance(cpu) {
            continue;
        }
        return TaskId(IDLE_TASKS[cpu].load(Ordering::Relaxed));
    }
}

/// Pull-model work-stealing: `cpu` looks for the busiest *other* CPU whose
/// ready-queue length beats its own by more than one, and steals the first
/// ready task on that queue whose affinity still allows `cpu`. Ties on load
/// go to the lowest CPU id, by construction — `other` is scanned ascending
/// and only replaces the current best on a strictly greater load.
pub fn balance(cpu: usize) -> bool {
    let my_load = runqueue::load(cpu);
    let mut victim: Option<usize> = None;
    let mut victim_load = my_load;
    for other in 0..MAX_CPUS {
        if other == cpu {
            continue;
        }
        let load = runqueue::load(other);
        if load > victim_load + 1 {
            victim_load = load;
            victim = Some(other);
        }
    }
    let Some(victim_cpu) = victim else {
        return false;
    };

    let stolen = runqueue::with_pair(cpu, victim_cpu, |_mine, theirs| {
        theirs.steal_if(|tid| task::get(tid).map(|t| t.affinity.allows(cpu)).unwrap_or(false))
    });

    match stolen {
        Some(tid) => {
            if let Some(t) = task::get(tid) {
                t.last_cpu.store(cpu, Ordering::Relaxed);
            }
            runqueue::push_back(cpu, tid);
            runqueue::with(cpu, |q| q.load_balances += 1);
            true
        }
        None => false,
    }
}

fn task_mut(t: &Task) -> &mut Task {
    // Every field mutated through this is either an atomic or guarded by its
    // own lock (`exit_reason`, `address_space`'s inner mutex); this only
    // widens access to the plain `ctx` field the same way
    // `task::set_priority`/`set_affinity` already do for `priority`/`affinity`.
    unsafe { &mut *(t as *const Task as *mut Task) }
}

/// Pops the head of `cpu`'s ready queue (falling back to a steal, then to
/// idle) and switches to it. If the outgoing task is still `Running` — the
/// ordinary preemption/quantum-expiry case — it is set `Ready` and pushed
/// onto this same CPU's tail, preserving affinity and cache warmth; a
/// caller that already transitioned the outgoing task to `Blocked` or
/// `Terminated` (and placed it wherever that state implies) is left alone.
pub fn schedule(cpu: usize) {
    // No `reap_pending` here: `prev` (if any) is still the context actually
    // executing this call, on its own stack. Reaping it before the switch
    // below would unmap the very stack this function is running on. The
    // bottom-of-function call handles it once we have genuinely switched
    // onto a different stack.
    let next = pick_next(cpu);
    let prev = runqueue::running(cpu);
    if prev == Some(next) {
        return;
    }

    if let Some(prev_id) = prev {
        if let Some(pt) = task::get(prev_id) {
            match pt.state() {
                State::Running => {
                    pt.set_state(State::Ready);
                    runqueue::push_back(cpu, prev_id);
                }
                State::Terminated => {
                    // Either this task's own `terminate_current_with_reason`
                    // call (already stored the same id) or a `kill` that
                    // landed while it was running elsewhere — either way it
                    // is switched away from here and reaped once something
                    // else is safely running on this CPU.
                    PENDING_REAP[cpu].store(prev_id.0, Ordering::Release);
                }
                State::Ready | State::Blocked => {}
            }
        }
    }

    runqueue::set_running(cpu, Some(next));
    if let Some(t) = task::get(next) {
        t.set_state(State::Running);
        t.last_cpu.store(cpu, Ordering::Relaxed);
    }

    match (prev.and_then(task::get), task::get(next)) {
        (Some(prev_task), Some(next_task)) => unsafe {
            ctx::switch_to(&mut task_mut(prev_task).ctx, &next_task.ctx);
        },
        (None, Some(next_task)) => unsafe {
            // First ever dispatch on this CPU: nothing to save.
            let mut throwaway = ctx::Context::new();
            ctx::switch_to(&mut throwaway, &next_task.ctx);
        },
        _ => {}
    }

    // Execution resumes here once some later `schedule` switches back to
    // whichever task made this call.
    reap_pending(cpu);
}

/// Re-derives the workload class from accumulated counters and resets the
/// quantum, per the adaptive-quantum rule.
fn rebalance_quantum(t: &Task) {
    let class = classify_workload(
        t.priority,
        t.cpu_time.load(Ordering::Relaxed),
        t.io_wait_time.load(Ordering::Relaxed),
        t.voluntary_yields.load(Ordering::Relaxed),
    );
    t.set_workload(class);
    let q = class.quantum_ticks();
    t.quantum.store(q, Ordering::Relaxed);
    t.ticks_remaining.store(q, Ordering::Relaxed);
}

/// Every 100 ticks, CPU 0 proactively rebalances even if its own queue
/// isn't empty yet — the per-`pick_next` steal only fires reactively, on a
/// CPU that has already run dry.
const PERIODIC_BALANCE_INTERVAL: u64 = 100;

/// Forwarded once per timer interrupt, IRQs already disabled, by
/// `platform::on_timer_tick`. Accounts the running task's consumed tick,
/// wakes due sleepers, and — once the quantum reaches zero — reclassifies
/// the task's workload, resets it, and reschedules.
pub fn tick(cpu: usize) {
    let now = TICKS[cpu].fetch_add(1, Ordering::Relaxed) + 1;
    wake_sleepers(cpu);

    if cpu == 0 && cfg!(feature = "sched-work-stealing") && now % PERIODIC_BALANCE_INTERVAL == 0 {
        balance(0);
    }

    let Some(tid) = runqueue::running(cpu) else {
        runqueue::with(cpu, |q| q.idle_ticks += 1);
        return;
    };
    if is_idle(cpu, tid) {
        runqueue::with(cpu, |q| q.idle_ticks += 1);
        // The idle task's own `halt` loop has no other preemption source —
        // without this, a CPU that has gone idle once never looks at its
        // ready queue or steals again, so anything `choose_cpu`/`balance`
        // places on it afterward sits forever. `schedule` is cheap to call
        // here: if `pick_next` still finds nothing (own queue empty, no
        // stealable victim), it hands back this same idle task and returns
        // immediately.
        schedule(cpu);
        return;
    }
    let Some(t) = task::get(tid) else { return };

    t.cpu_time.fetch_add(1, Ordering::Relaxed);
    runqueue::with(cpu, |q| q.busy_ticks += 1);

    let remaining = t.ticks_remaining.load(Ordering::Relaxed);
    if remaining <= 1 {
        rebalance_quantum(t);
        schedule(cpu);
    } else {
        t.ticks_remaining.store(remaining - 1, Ordering::Relaxed);
    }
}

/// Voluntary preemption: the calling task gives up the remainder of its
/// quantum. Forcing `ticks_remaining` to zero means the very next tick this
/// task is running again re-evaluates its workload class immediately,
/// rather than waiting out a quantum it no longer holds — which is what
/// lets frequent yielders converge on `interactive` through the ordinary
/// `classify_workload` rule instead of a separate yield-triggered path.
pub fn yield_now() {
    let cpu = crate::platform::cpu::current_cpu_id();
    let Some(tid) = runqueue::running(cpu) else { return };
    if let Some(t) = task::get(tid) {
        t.ticks_remaining.store(0, Ordering::Relaxed);
        t.voluntary_yields.fetch_add(1, Ordering::Relaxed);
    }
    schedule(cpu);
}

/// Blocks the calling task for at least `ms` milliseconds. The task is
/// parked off every run queue until its wake tick elapses, then
/// [`tick`]/`wake_sleepers` makes it ready again on the CPU it slept on.
pub fn sleep(ms: u64) {
    let cpu = crate::platform::cpu::current_cpu_id();
    let Some(tid) = runqueue::running(cpu) else { return };
    let Some(t) = task::get(tid) else { return };

    let ticks = ((ms * TICK_HZ) / 1000).max(1);
    let wake_at = TICKS[cpu].load(Ordering::Relaxed) + ticks;
    t.sleep_until_tick.store(wake_at, Ordering::Relaxed);
    t.io_wait_time.fetch_add(ticks, Ordering::Relaxed);
    t.set_state(State::Blocked);

    if SLEEPING[cpu].lock().push(tid).is_err() {
        crate::log::log_warn("sched: sleeper table full, task rescheduled immediately");
        t.set_state(State::Ready);
        runqueue::push_back(cpu, tid);
    }
    schedule(cpu);
}

/// Ends the calling task's execution with no recorded reason. Never
/// returns — the caller's stack is abandoned the moment `schedule` switches
/// away from it.
pub fn terminate_current() -> ! {
    terminate_current_with_reason("task exited")
}

/// As [`terminate_current`], recording `reason` (surfaced later through
/// `Task::exit_reason`) before switching away. Used directly by
/// `memory::vmm::escalate` when a user-mode fault cannot be resolved.
pub fn terminate_current_with_reason(reason: &'static str) -> ! {
    let cpu = crate::platform::cpu::current_cpu_id();
    let tid = runqueue::running(cpu).expect("terminate_current called with no running task");
    if let Some(t) = task::get(tid) {
        t.set_state(State::Terminated);
        t.set_exit_reason(reason);
    }
    PENDING_REAP[cpu].store(tid.0, Ordering::Release);
    schedule(cpu);
    // `schedule` only returns by switching back into this call frame, which
    // cannot happen: nothing re-enqueues a terminated task's id.
    crate::corrupted!("terminated task resumed")
}

/// External-collaborator name for [`terminate_current`].
pub fn exit() -> ! {
    terminate_current()
}

/// Ends `tid` regardless of who calls it. Killing the caller's own task is
/// just `terminate_current_with_reason` (never returns); killing any other
/// task marks it `Terminated` and reclaims it immediately if it is sitting
/// idle (ready-queued or sleeping) anywhere, or otherwise leaves it for
/// `schedule`'s outgoing-task handling to notice and reap the next time the
/// CPU it is actually running on enters the scheduler — matching a task
/// transitioning to terminated "at its next scheduler entry" rather than
/// being torn out of a live context switch.
pub fn kill(tid: TaskId) {
    if current() == Some(tid) {
        terminate_current_with_reason("killed");
    }

    let Some(t) = task::get(tid) else { return };
    if t.state() == State::Terminated {
        return;
    }
    t.set_state(State::Terminated);
    t.set_exit_reason("killed");

    let cpu = t.last_cpu.load(Ordering::Relaxed);
    if cpu >= MAX_CPUS {
        return;
    }

    if runqueue::remove(cpu, tid) {
        task::reap(tid);
        return;
    }

    let mut sleeping = SLEEPING[cpu].lock();
    if let Some(pos) = sleeping.iter().position(|&s| s == tid) {
        sleeping.swap_remove(pos);
        drop(sleeping);
        task::reap(tid);
    }
    // Otherwise `tid` is presently running (possibly on `cpu`, possibly the
    // very CPU calling `kill`) or was already reaped by a racing `pick_next`
    // that found it `Terminated` first; either way there is nothing left to
    // reclaim from here.
}

/// Point-in-time accounting snapshot for a task, surfaced to whatever
/// collaborator wants scheduler visibility without reaching into `Task`
/// internals directly.
#[derive(Debug, Clone, Copy)]
pub struct TaskInfo {
    pub id: TaskId,
    pub priority: TaskPriority,
    pub state: State,
    pub workload: WorkloadClass,
    pub cpu_time: u64,
    pub io_wait_time: u64,
    pub voluntary_yields: u32,
    pub last_cpu: usize,
}

pub fn task_info(tid: TaskId) -> Option<TaskInfo> {
    let t = task::get(tid)?;
    Some(TaskInfo {
        id: t.id,
        priority: t.priority,
        state: t.state(),
        workload: t.workload(),
        cpu_time: t.cpu_time.load(Ordering::Relaxed),
        io_wait_time: t.io_wait_time.load(Ordering::Relaxed),
        voluntary_yields: t.voluntary_yields.load(Ordering::Relaxed),
        last_cpu: t.last_cpu.load(Ordering::Relaxed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_idle_matches_only_the_recorded_idle_task() {
        IDLE_TASKS[0].store(42, Ordering::Relaxed);
        assert!(is_idle(0, TaskId(42)));
        assert!(!is_idle(0, TaskId(43)));
        IDLE_TASKS[0].store(NONE_TID, Ordering::Relaxed);
    }

    #[test]
    fn pick_next_falls_back_to_idle_when_queue_and_steal_both_empty() {
        let cpu = 5;
        IDLE_TASKS[cpu].store(7, Ordering::Relaxed);
        assert_eq!(pick_next(cpu), TaskId(7));
        IDLE_TASKS[cpu].store(NONE_TID, Ordering::Relaxed);
    }

    #[test]
    fn pick_next_prefers_own_ready_queue_over_idle() {
        let cpu = 6;
        IDLE_TASKS[cpu].store(99, Ordering::Relaxed);
        runqueue::push_back(cpu, TaskId(123));
        assert_eq!(pick_next(cpu), TaskId(123));
        IDLE_TASKS[cpu].store(NONE_TID, Ordering::Relaxed);
    }

    #[test]
    fn balance_declines_when_no_queue_is_meaningfully_busier() {
        // Two empty queues: nothing to steal, nothing busier than `cpu`.
        assert!(!balance(8));
    }

    #[test]
    fn cpu_stats_defaults_to_zeroed_counters() {
        let s = CpuStats::default();
        assert_eq!(s.ready, 0);
        assert_eq!(s.busy_ticks, 0);
        assert_eq!(s.idle_ticks, 0);
        assert_eq!(s.load_balances, 0);
    }

    #[test]
    fn stats_reports_current_queue_depth() {
        let cpu = 9;
        runqueue::push_back(cpu, TaskId(1));
        runqueue::push_back(cpu, TaskId(2));
        assert_eq!(stats(cpu).ready, 2);
        runqueue::pop_front(cpu);
        runqueue::pop_front(cpu);
    }

    #[test]
    fn task_info_is_none_for_an_unknown_task() {
        assert!(task_info(TaskId(0xdead_beef)).is_none());
    }
}
