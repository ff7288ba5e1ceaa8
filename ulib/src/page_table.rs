//! Reading the caller's own page table.
//!
//! The kernel maps every environment's page table read-only at [`UVPT`], so
//! user code can inspect its own mappings without a system call. The window
//! is two-level: a page table entry is only meaningful once the covering
//! page directory entry has been found present.
//!
//! [`UVPT`]: abyss::memlayout::UVPT

use crate::syscall::Kernel;
use abyss::{Pte, PteFlags, Va};

/// Software bit marking a page as copy-on-write.
///
/// A page carrying this bit is mapped read-only in every environment that
/// shares it. The kernel never interprets the bit; only the fault handler
/// does.
pub const PTE_COW: PteFlags = PteFlags::AVAIL_2;

/// Read the entry mapping `va` in the calling environment.
///
/// Returns [`Pte::EMPTY`] if no page table covers `va`.
pub fn pte_at(kernel: &dyn Kernel, va: Va) -> Pte {
    if kernel.uvpd(va.pdx()).is_present() {
        kernel.uvpt(va.pn())
    } else {
        Pte::EMPTY
    }
}

/// What one page of an environment is, from the point of view of `fork`.
///
/// A page is in exactly one state. If both [`PTE_COW`] and
/// [`PteFlags::W`] are set on an entry, it is [`PageState::CowShared`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Nothing is mapped.
    Absent,
    /// Mapped, but not accessible from user mode.
    KernelOnly,
    /// User-readable and not writable. May be shared freely.
    SharedImmutable,
    /// User-writable and owned by this environment alone.
    PrivateWritable,
    /// Read-only, and shared with at least one other environment until
    /// someone writes to it.
    CowShared,
}

impl PageState {
    /// Classify a page table entry.
    pub fn classify(pte: Pte) -> Self {
        let flags = pte.flags();
        if !flags.contains(PteFlags::P) {
            PageState::Absent
        } else if !flags.contains(PteFlags::U) {
            PageState::KernelOnly
        } else if flags.contains(PTE_COW) {
            PageState::CowShared
        } else if flags.contains(PteFlags::W) {
            PageState::PrivateWritable
        } else {
            PageState::SharedImmutable
        }
    }

    /// Classify the page containing `va` in the calling environment.
    pub fn of(kernel: &dyn Kernel, va: Va) -> Self {
        Self::classify(pte_at(kernel, va.page_down()))
    }
}
