//! Crate-wide error taxonomy.
//!
//! Every recoverable failure in the core is one of these kinds; there are no
//! raw negative-int sentinels and no conflating `None` with "permission
//! denied" (a caller that needs to distinguish "not found" from "not allowed"
//! always can). Failures that indicate a programming error rather than a
//! runtime condition escalate through [`panic_at`] instead of being returned.

use core::fmt;

/// Sum type for every recoverable failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Frame or heap exhaustion. Kernel contexts may choose to escalate this
    /// to a panic at the call site; the core itself only ever returns it.
    OutOfMemory,
    /// Null pointer, zero length, a misaligned `FIXED` hint, overflowing
    /// `addr+length`, and similar caller-error conditions.
    InvalidArgument,
    /// Access outside any VMA.
    NotMapped,
    /// Access inside a VMA but violating its protection triple.
    Segfault,
    /// A free of an object the owning allocator does not believe is live.
    /// Logged by the caller and otherwise treated as a no-op; never
    /// propagated as a hard error since a double-free must not corrupt
    /// allocator state.
    DoubleFree,
    /// Address-space id, task id, or another fixed-capacity slot table is
    /// full.
    Exhausted,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NotMapped => "not mapped",
            KernelError::Segfault => "segmentation fault",
            KernelError::DoubleFree => "double free",
            KernelError::Exhausted => "table exhausted",
        };
        f.write_str(msg)
    }
}

pub type KResult<T> = Result<T, KernelError>;

/// Disables interrupts and halts the current CPU. Used for
/// [`KernelError`]-independent programming-error conditions: corrupted queue
/// linkage, reserved PTE bits set, a self-inconsistent frame bitmap. These
/// are never returned as a `KernelError` because there is no caller-side
/// recovery for them.
#[cold]
#[inline(never)]
pub fn panic_at(file: &'static str, line: u32, msg: &str) -> ! {
    crate::log::log_fatal(file, line, msg);
    crate::platform::cpu::disable_irq();
    loop {
        crate::platform::cpu::halt();
    }
}

/// Panics with `CorruptedInvariant` semantics at the call site.
#[macro_export]
macro_rules! corrupted {
    ($msg:expr) => {
        $crate::error::panic_at(file!(), line!(), $msg)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::format;

    #[test]
    fn display_messages_are_stable_and_lowercase() {
        assert_eq!(format!("{}", KernelError::OutOfMemory), "out of memory");
        assert_eq!(format!("{}", KernelError::InvalidArgument), "invalid argument");
        assert_eq!(format!("{}", KernelError::NotMapped), "not mapped");
        assert_eq!(format!("{}", KernelError::Segfault), "segmentation fault");
        assert_eq!(format!("{}", KernelError::DoubleFree), "double free");
        assert_eq!(format!("{}", KernelError::Exhausted), "table exhausted");
    }

    #[test]
    fn kernel_errors_are_distinct_and_comparable() {
        assert_ne!(KernelError::OutOfMemory, KernelError::InvalidArgument);
        assert_eq!(KernelError::DoubleFree, KernelError::DoubleFree);
    }
}
