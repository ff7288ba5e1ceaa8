//! Layout of the user half of the virtual address space.
//!
//! ```text
//!                      +------------------------------+ 0xffffffff
//!                      |        kernel only           |
//!    ULIM ---------->  +------------------------------+ 0xef800000
//!                      |  read-only page table (uvpt) |
//!    UVPT ---------->  +------------------------------+ 0xef400000
//!                      |   read-only kernel data      |
//!    UTOP,  -------->  +------------------------------+ 0xeec00000
//!    UXSTACKTOP        |   user exception stack       | one page, never shared
//!                      +------------------------------+ 0xeebff000
//!                      |        empty guard           |
//!    USTACKTOP  ---->  +------------------------------+ 0xeebfe000
//!                      |   normal user stack          |
//!                      +------------------------------+
//!                      |             ...              |
//!                      |  program data, heap, text    |
//!    UTEXT  -------->  +------------------------------+ 0x00800000
//!    PFTEMP -------->  |  fault handler scratch page  | 0x007ff000
//!                      |             ...              |
//!    UTEMP  -------->  +------------------------------+ 0x00400000
//!                      |        empty                 |
//!                      +------------------------------+ 0x00000000
//! ```
//!
//! Every address an environment may ask the kernel to map lies below
//! [`UTOP`].

use crate::addressing::{PAGE_SIZE, PT_SIZE, Va};

/// Top of memory an environment may map on its own.
pub const UTOP: Va = Va(0xeec0_0000);

/// Top of the user exception stack.
///
/// The single page below it is what the kernel switches to before running
/// the page fault upcall.
pub const UXSTACKTOP: Va = UTOP;

/// Top of the normal user stack.
pub const USTACKTOP: Va = Va(UTOP.0 - 2 * PAGE_SIZE);

/// Start of the read-only page table window.
pub const UVPT: Va = Va(0xef40_0000);

/// Top of user-readable memory.
pub const ULIM: Va = Va(0xef80_0000);

/// Where user programs are linked.
pub const UTEXT: Va = Va(2 * PT_SIZE);

/// A region the user may use for temporary mappings.
pub const UTEMP: Va = Va(PT_SIZE);

/// Scratch page used by the page fault handler while it builds a private
/// copy of a faulting page.
pub const PFTEMP: Va = Va(UTEMP.0 + PT_SIZE - PAGE_SIZE);

/// The single page of the user exception stack.
#[inline]
pub const fn uxstack_page() -> Va {
    Va(UXSTACKTOP.0 - PAGE_SIZE)
}
