//! Page table entries, fault error codes and the user trap frame.

use crate::addressing::{Pa, Va};

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page.
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the page.
        const W = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the page.
        const U = 1 << 2;
        /// Page-level write-through.
        const PWT = 1 << 3;
        /// Page-level cache disable.
        const PCD = 1 << 4;
        /// Accessed; set by hardware when software has accessed the page.
        const A = 1 << 5;
        /// Dirty; set by hardware when software has written to the page.
        const D = 1 << 6;
        /// Page size; only meaningful in a page directory entry.
        const PS = 1 << 7;
        /// Global; the translation survives an address space switch.
        const G = 1 << 8;
        /// Available for software use; never interpreted by the kernel.
        const AVAIL_0 = 1 << 9;
        /// Available for software use; never interpreted by the kernel.
        const AVAIL_1 = 1 << 10;
        /// Available for software use; never interpreted by the kernel.
        const AVAIL_2 = 1 << 11;
    }
}

impl PteFlags {
    /// All three software-available bits.
    pub const AVAIL: Self = Self::from_bits_truncate(
        Self::AVAIL_0.bits() | Self::AVAIL_1.bits() | Self::AVAIL_2.bits(),
    );

    /// The only bits a page mapping system call may carry.
    ///
    /// A permission handed to the kernel must contain [`PteFlags::P`] and
    /// [`PteFlags::U`], and nothing outside this set.
    pub const SYSCALL: Self = Self::from_bits_truncate(
        Self::AVAIL.bits() | Self::P.bits() | Self::W.bits() | Self::U.bits(),
    );

    /// Whether this permission may be passed to a page mapping system call.
    #[inline]
    pub const fn is_syscall_perm(self) -> bool {
        let required = Self::P.bits() | Self::U.bits();
        self.bits() & required == required && Self::SYSCALL.contains(self)
    }
}

/// Page Table Entry (PTE).
///
/// The upper 20 bits hold the frame address, the lower 12 the [`PteFlags`].
/// User code only ever sees copies of entries, read through the `uvpt`
/// window; it cannot modify one except by asking the kernel.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl Pte {
    /// An entry that maps nothing.
    pub const EMPTY: Self = Self(0);

    /// Build an entry for frame `pa` with `flags`.
    #[inline]
    pub const fn new(pa: Pa, flags: PteFlags) -> Self {
        Self(pa.page_down().into_usize() | flags.bits())
    }

    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the page is present, containing the physical address.
    /// - `None` if the page is not present (i.e., the "P" flag is not set).
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & !PteFlags::all().bits())
        } else {
            None
        }
    }

    /// Get the flags associated with this page table entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.pa() {
            Some(pa) => write!(f, "Pte({:?}, {:?})", pa, self.flags()),
            None => write!(f, "Pte(-, {:?})", self.flags()),
        }
    }
}

/// Page Directory Entry (PDE).
///
/// A present directory entry means a page table exists for the covered
/// 4 MiB; it says nothing about whether any individual page in it is mapped.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Pde(pub usize);

impl Pde {
    /// An entry with no page table behind it.
    pub const EMPTY: Self = Self(0);

    /// Get the flags associated with this page directory entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Whether a page table is installed for this entry.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }
}

bitflags::bitflags! {
    /// Error code the processor pushes on a page fault.
    pub struct FaultErrorCode: usize {
        /// The fault was a protection violation on a present page. If clear,
        /// the page was not present.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The fault happened in user mode.
        const USER = 1 << 2;
    }
}

/// The fault context handed to the page fault upcall.
///
/// This is pushed on the user exception stack by the kernel, once per fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapframe {
    /// The address that caused the page fault.
    pub fault_va: Va,
    /// Why the access faulted.
    pub err: FaultErrorCode,
}

impl UTrapframe {
    /// Whether the faulting access was a write.
    #[inline]
    pub fn is_write(&self) -> bool {
        self.err.contains(FaultErrorCode::WRITE)
    }
}
