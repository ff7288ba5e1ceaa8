//! A kernel model for exercising `ulib` on the host.
//!
//! [`SimKernel`] keeps the kernel side of the user-level fork contract:
//! reference-counted physical frames, two-level user page tables, the
//! environment table with its identifier scheme and parent/child permission
//! rule, the eight system calls `ulib` issues, and page fault delivery to a
//! registered upcall running on the exception stack.
//!
//! It is not a scheduler. A test picks the environment to run with
//! [`SimKernel::run`]; every [`ulib::Kernel`] call then acts for that
//! environment, and [`SimKernel::read`]/[`SimKernel::write`] behave like
//! loads and stores it executes. A forked child "returns from fork" the
//! first time it runs and calls [`ulib::fork()`] again with a copy of its
//! parent's [`ulib::Env`].
//!
//! ```
//! use abyss::{PteFlags, Va};
//! use ulib::{Env, ForkOutcome, fork};
//! use ulib_grader::SimKernel;
//!
//! let kernel = SimKernel::default();
//! let root = kernel.create_env().unwrap();
//! let va = Va::new(0x0080_0000).unwrap();
//! kernel
//!     .load_page(root, va, PteFlags::P | PteFlags::U | PteFlags::W, b"hello")
//!     .unwrap();
//! kernel.run(root).unwrap();
//!
//! let mut env = Env::new(&kernel).unwrap();
//! let mut child_env = env.clone();
//! let ForkOutcome::Parent { child } = fork(&mut env).unwrap() else {
//!     unreachable!()
//! };
//! kernel.write(va, b"world").unwrap();
//!
//! kernel.run(child).unwrap();
//! assert_eq!(fork(&mut child_env), Ok(ForkOutcome::Child));
//! assert_eq!(kernel.read(va, 5).unwrap(), b"hello");
//! ```

pub mod config;
mod env;
mod frame;
pub mod kernel;
mod syscall;

pub use config::{SimConfig, SimKernelBuilder};
pub use kernel::{FaultRecord, SimFault, SimKernel, SyscallRecord};
