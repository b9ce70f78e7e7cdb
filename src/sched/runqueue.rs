//! Per-CPU ready queues.
//!
//! `memory::layout::MAX_CPUS` independent FIFOs:
//! one spinlock per queue, `balance` locks a thief/victim pair in fixed
//! CPU-id order to avoid deadlock.

use alloc::collections::VecDeque;
use spin::{Mutex, MutexGuard};

use crate::memory::layout::MAX_CPUS;
use crate::sched::task::TaskId;

pub struct RunQueue {
    ready: VecDeque<TaskId>,
    pub running: Option<TaskId>,
    pub busy_ticks: u64,
    pub idle_ticks: u64,
    pub load_balances: u64,
}

impl RunQueue {
    const fn new() -> Self {
        RunQueue { ready: VecDeque::new(), running: None, busy_ticks: 0, idle_ticks: 0, load_balances: 0 }
    }

    #[inline]
    pub fn load(&self) -> usize {
        self.ready.len()
    }

    #[inline]
    pub fn push_back(&mut self, tid: TaskId) {
        self.ready.push_back(tid);
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<TaskId> {
        self.ready.pop_front()
    }

    /// Removes and returns the first ready task for which `pred` holds,
    /// scanning front-to-back. Used by `sched::balance`'s affinity-respecting
    /// steal — a plain `pop_front` would ignore affinity entirely.
    pub fn steal_if(&mut self, pred: impl Fn(TaskId) -> bool) -> Option<TaskId> {
        let idx = self.ready.iter().position(|&t| pred(t))?;
        self.ready.remove(idx)
    }
}

lazy_static::lazy_static! {
    static ref QUEUES: [Mutex<RunQueue>; MAX_CPUS] = core::array::from_fn(|_| Mutex::new(RunQueue::new()));
}

pub fn with<R>(cpu: usize, f: impl FnOnce(&mut RunQueue) -> R) -> R {
    let mut guard = QUEUES[cpu].lock();
    f(&mut guard)
}

/// Locks two distinct CPUs' queues in ascending CPU-id order regardless of
/// which one is the thief, so two CPUs racing to balance against each other
/// can never deadlock.
pub fn with_pair<R>(a: usize, b: usize, f: impl FnOnce(&mut RunQueue, &mut RunQueue) -> R) -> R {
    assert_ne!(a, b, "with_pair requires distinct CPUs");
    if a < b {
        let mut ga = QUEUES[a].lock();
        let mut gb = QUEUES[b].lock();
        f(&mut ga, &mut gb)
    } else {
        let mut gb = QUEUES[b].lock();
        let mut ga = QUEUES[a].lock();
        f(&mut ga, &mut gb)
    }
}

pub fn load(cpu: usize) -> usize {
    QUEUES[cpu].lock().load()
}

pub fn running(cpu: usize) -> Option<TaskId> {
    QUEUES[cpu].lock().running
}

pub fn set_running(cpu: usize, tid: Option<TaskId>) {
    QUEUES[cpu].lock().running = tid;
}

pub fn push_back(cpu: usize, tid: TaskId) {
    QUEUES[cpu].lock().push_back(tid);
}

pub fn pop_front(cpu: usize) -> Option<TaskId> {
    QUEUES[cpu].lock().pop_front()
}

fn lock(cpu: usize) -> MutexGuard<'static, RunQueue> {
    QUEUES[cpu].lock()
}

/// Removes `tid` from wherever it currently sits in `cpu`'s ready queue, if
/// present. Used by `kill`/priority changes; not on the hot dispatch path.
pub fn remove(cpu: usize, tid: TaskId) -> bool {
    let mut q = lock(cpu);
    let before = q.ready.len();
    q.ready.retain(|&t| t != tid);
    q.ready.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let mut q = RunQueue::new();
        q.push_back(TaskId(1));
        q.push_back(TaskId(2));
        q.push_back(TaskId(3));
        assert_eq!(q.pop_front(), Some(TaskId(1)));
        assert_eq!(q.pop_front(), Some(TaskId(2)));
        assert_eq!(q.load(), 1);
    }

    #[test]
    fn pop_front_on_empty_queue_is_none() {
        let mut q = RunQueue::new();
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn steal_if_takes_first_matching_and_leaves_rest() {
        let mut q = RunQueue::new();
        q.push_back(TaskId(1));
        q.push_back(TaskId(2));
        q.push_back(TaskId(3));
        let stolen = q.steal_if(|t| t == TaskId(2));
        assert_eq!(stolen, Some(TaskId(2)));
        assert_eq!(q.load(), 2);
        assert_eq!(q.pop_front(), Some(TaskId(1)));
        assert_eq!(q.pop_front(), Some(TaskId(3)));
    }

    #[test]
    fn steal_if_no_match_leaves_queue_untouched() {
        let mut q = RunQueue::new();
        q.push_back(TaskId(1));
        assert_eq!(q.steal_if(|t| t == TaskId(99)), None);
        assert_eq!(q.load(), 1);
    }

    #[test]
    fn with_pair_locks_in_ascending_cpu_order() {
        let a_load = with_pair(2, 0, |mine, theirs| {
            mine.push_back(TaskId(10));
            theirs.push_back(TaskId(20));
            (mine.load(), theirs.load())
        });
        assert_eq!(a_load, (1, 1));
        assert_eq!(load(2), 1);
        assert_eq!(load(0), 1);
    }

    #[test]
    fn remove_drops_matching_id_only() {
        push_back(1, TaskId(5));
        push_back(1, TaskId(6));
        assert!(remove(1, TaskId(5)));
        assert!(!remove(1, TaskId(5)));
        assert_eq!(load(1), 1);
        assert_eq!(pop_front(1), Some(TaskId(6)));
    }
}
