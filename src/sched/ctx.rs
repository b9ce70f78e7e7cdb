//! CPU context save/restore.
//!
//! `Context` holds only the saved stack pointer; the callee-saved registers
//! and flags live on the stack itself, spilled and restored by a pair of
//! assembled entry points (`context_switch`/`task_bootstrap`). Assembled via
//! `global_asm!` rather than a linked `.s` file, so the crate needs only
//! `cargo build`, no separate assembler step.
//!
//! `switch_to`'s contract: resumes `next` at the
//! instruction following its own last `switch_to`, or — for a task that has
//! never run — at `entry(arg)` with interrupts enabled.

use core::arch::global_asm;

pub type EntryFn = extern "C" fn(usize) -> !;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    rsp: u64,
}

impl Context {
    pub const fn new() -> Self {
        Context { rsp: 0 }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

extern "C" {
    fn __kcore_ctx_switch(prev_rsp_slot: *mut u64, next_rsp: u64);
}

// Every saved frame below carries one extra "resume rax" slot beneath
// rflags, alongside the six callee-saved registers. Ordinary switches never
// give it meaning (rax is caller-saved — dead across the Rust call that
// invokes `switch_to`), but `__kcore_fork_snapshot` uses the exact same
// frame shape to smuggle a value into a forked child's rax the one time it
// matters: a child resumed via this same epilogue must see `fork_current`
// return 0, while the parent (which never goes through this epilogue for
// its own continuation) keeps the real child ID the Rust call returned.
global_asm!(
    ".global __kcore_ctx_switch",
    "__kcore_ctx_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push 0",
    "pushfq",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "popfq",
    "pop rax",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

global_asm!(
    ".global __kcore_task_bootstrap",
    "__kcore_task_bootstrap:",
    "pop rdi",
    "pop rax",
    "sti",
    "call rax",
    "pop rax",
    "jmp rax",
);

extern "C" {
    fn __kcore_task_bootstrap();
}

// Snapshots the calling task's register state in the same shape
// `__kcore_ctx_switch` expects, then calls into Rust to build the child TCB.
// The parent falls through to its own manual unwind (preserving rax, the
// Rust call's return value — the child's ID); the child's `ret` is instead
// reached later, from an entirely different call to `__kcore_ctx_switch`'s
// epilogue, which pops the resume-rax slot (pushed here as a literal `0`)
// into rax. Both paths land at the same return address — the instruction
// after `call __kcore_fork_continue` — because it is the same stack slot,
// read twice.
global_asm!(
    ".global __kcore_fork_snapshot",
    "__kcore_fork_snapshot:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push 0",
    "pushfq",
    "mov rdi, rsp",
    "call __kcore_fork_continue",
    "popfq",
    "pop rcx",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

/// Switches from `prev` to `next`. Does not return until some later
/// `switch_to` resumes `prev` again. Must be called with the owning run
/// queue's lock already released — the callee-saved registers spilled here
/// include nothing queue-related, but holding a spinlock across a stack swap
/// would hand the unlock to whichever task next runs on this CPU.
pub unsafe fn switch_to(prev: &mut Context, next: &Context) {
    __kcore_ctx_switch(&mut prev.rsp as *mut u64, next.rsp);
}

/// Builds the initial stack frame for a brand-new task: a `switch_to` into
/// it lands in `__kcore_task_bootstrap`, which calls `entry(arg)` with
/// interrupts enabled; if `entry` ever returns, bootstrap falls through to
/// `exit_trampoline` instead of returning into garbage.
pub unsafe fn init_context(ctx: &mut Context, stack_top: u64, entry: EntryFn, arg: usize, exit_trampoline: extern "C" fn() -> !) {
    let mut sp = stack_top & !0xf;

    let mut push = |val: u64| {
        sp -= 8;
        core::ptr::write(sp as *mut u64, val);
    };

    push(exit_trampoline as u64);
    push(entry as u64);
    push(arg as u64);
    push(__kcore_task_bootstrap as u64); // return address popped by `ret`
    push(0); // rbp
    push(0); // rbx
    push(0); // r12
    push(0); // r13
    push(0); // r14
    push(0); // r15
    push(0); // resume-rax slot (unused for a never-run task)
    push(0x0202); // rflags: reserved bit 1 set, IF set

    ctx.rsp = sp;
}

/// Used only by `sched::task::fork_continue` to install a child's snapshot
/// `rsp` (captured by `__kcore_fork_snapshot`) directly, bypassing
/// `init_context`'s bootstrap-frame construction — a forked child resumes
/// mid-function, not at a fresh entry point.
pub unsafe fn set_rsp(ctx: &mut Context, rsp: u64) {
    ctx.rsp = rsp;
}
