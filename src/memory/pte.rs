//! Protection triple shared by VMAs and the page-table walker.
//!
//! Kept as its own small module (rather than folded into `paging` or `vma`)
//! because both layers need the same bits: a VMA's protection triple and a
//! PTE's writable/no-execute flags are the same three booleans read by two
//! different consumers.

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl Prot {
    pub const NONE: Prot = Prot::empty();
    pub const RW: Prot = Prot::from_bits_truncate(Prot::READ.bits() | Prot::WRITE.bits());
    pub const RX: Prot = Prot::from_bits_truncate(Prot::READ.bits() | Prot::EXEC.bits());

    #[inline]
    pub fn write(self) -> bool {
        self.contains(Prot::WRITE)
    }

    #[inline]
    pub fn exec(self) -> bool {
        self.contains(Prot::EXEC)
    }

    #[inline]
    pub fn read(self) -> bool {
        self.contains(Prot::READ)
    }

    /// Converts to hardware page-table flags. `user` is threaded in
    /// separately because it is a property of the *mapping* (kernel vs.
    /// task-owned address space), not of the VMA's protection triple.
    pub fn to_table_flags(self, user: bool) -> x86_64::structures::paging::PageTableFlags {
        use x86_64::structures::paging::PageTableFlags as F;
        let mut f = F::PRESENT;
        if self.write() {
            f |= F::WRITABLE;
        }
        if user {
            f |= F::USER_ACCESSIBLE;
        }
        if !self.exec() {
            f |= F::NO_EXECUTE;
        }
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rw_implies_no_execute_flag() {
        let f = Prot::RW.to_table_flags(false);
        assert!(f.contains(x86_64::structures::paging::PageTableFlags::WRITABLE));
        assert!(f.contains(x86_64::structures::paging::PageTableFlags::NO_EXECUTE));
    }

    #[test]
    fn exec_drops_no_execute_flag() {
        let f = Prot::RX.to_table_flags(false);
        assert!(!f.contains(x86_64::structures::paging::PageTableFlags::NO_EXECUTE));
        assert!(!f.contains(x86_64::structures::paging::PageTableFlags::WRITABLE));
    }
}
