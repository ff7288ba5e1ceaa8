//! # User-level `fork` with Copy-On-Write
//!
//! `fork` creates a new environment by duplicating the calling one. Unlike a
//! monolithic kernel, the kernel beneath this library knows nothing about
//! `fork`: it only offers a handful of primitives (create a blank child,
//! allocate a page, map a page, unmap a page, register a page fault upcall,
//! mark an environment runnable). Everything else, including deciding how
//! each page is shared and repairing write faults, happens here, in user
//! space.
//!
//! ## Copy-On-Write
//!
//! Copying every page of the parent at fork time is wasteful: most children
//! touch only a few pages before they exit or replace their image. Instead,
//! the parent and the child initially share every frame. A page either of
//! them may write is mapped read-only in **both** environments and marked
//! with a software bit, [`PTE_COW`]. The first write to such a page from
//! either side traps; the fault upcall then gives the writer a private copy
//! and leaves the other side alone.
//!
//! A page goes through the following states, independently in each
//! environment that maps it:
//!
//! ```text
//!  PrivateWritable --(fork)--> CowShared --(write fault)--> PrivateWritable
//!                                                            (new frame)
//!  SharedImmutable --(fork)--> SharedImmutable   (never copied)
//! ```
//!
//! `CowShared` is the only state in which two environments reference one
//! frame that either could change.
//!
//! ## Layout of this crate
//!
//! - [`syscall`]: the [`Kernel`] seam and one typed wrapper per system call.
//! - [`page_table`]: reading the read-only page table window and classifying
//!   a page into a [`PageState`].
//! - [`pgfault`]: installing the fault upcall, and the copy-on-write fault
//!   handler itself.
//! - [`fork`](mod@fork): the per-page duplication policy and the fork
//!   sequence.
//! - [`Env`]: the explicit "who am I" context every operation takes.
//!
//! [`PTE_COW`]: page_table::PTE_COW
//! [`PageState`]: page_table::PageState
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod env;
pub mod error;
pub mod fork;
pub mod page_table;
pub mod pgfault;
pub mod syscall;

pub use abyss;
pub use config::ForkConfig;
pub use env::Env;
pub use error::{ForkError, Violation};
pub use fork::{ForkOutcome, fork};
pub use syscall::{Kernel, Upcall};
