//! The abyss between user environments and the kernel.
//!
//! This crate holds everything both sides of the system call boundary must
//! agree on bit-for-bit: the shape of addresses, the layout of the user half
//! of the address space, the page table entry format, the fault error code
//! pushed on a page fault, environment identifiers, system call numbers, and
//! the error codes the kernel returns.
//!
//! Nothing in here performs a system call or touches a page table. The user
//! library ([`ulib`]) and the kernel model in `ulib-grader` both build on top
//! of these definitions.
//!
//! [`ulib`]: ../ulib/index.html
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod addressing;
pub mod env;
pub mod error;
pub mod memlayout;
pub mod mmu;
pub mod syscall;

pub use addressing::{PAGE_SIZE, Pa, Va};
pub use env::{EnvId, EnvStatus};
pub use error::KernelError;
pub use mmu::{FaultErrorCode, Pde, Pte, PteFlags, UTrapframe};
pub use syscall::SyscallNumber;
