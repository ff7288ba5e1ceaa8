//! Errors raised by [`fork`](crate::fork()) and the fault handler.

use crate::page_table::PageState;
use abyss::{FaultErrorCode, KernelError, SyscallNumber, Va};

/// A broken assumption about the faulting access or the address space.
///
/// Each of these means the environment is in a state `fork` cannot repair;
/// the environment should not keep running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Violation {
    /// A fault reached the handler, but the access was not a write.
    NotWriteFault {
        /// Faulting address.
        va: Va,
        /// Error code of the fault.
        err: FaultErrorCode,
    },
    /// A write faulted on a page that is not copy-on-write.
    NotCopyOnWrite {
        /// Faulting address.
        va: Va,
        /// What the page actually is.
        state: PageState,
    },
    /// The exception stack page was about to be shared with a child.
    ExceptionStackShared,
    /// A user page sits at the fault handler's scratch address.
    ScratchPageInUse {
        /// Address inside the scratch page.
        va: Va,
    },
}

/// Error type of [`fork`](crate::fork()),
/// [`duppage`](crate::fork::duppage) and the fault handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkError {
    /// See [`Violation`].
    InvariantViolation(Violation),
    /// A system call needed to duplicate a page, fix up a fault or finish a
    /// child failed.
    ResourceExhausted {
        /// The system call that failed.
        syscall: SyscallNumber,
        /// What the kernel answered.
        error: KernelError,
    },
    /// The kernel refused to create a child.
    ///
    /// Nothing was changed in the caller's address space.
    ChildCreationFailed(KernelError),
}

impl ForkError {
    /// Whether the caller cannot sensibly keep running after this error.
    ///
    /// A failed child creation leaves the caller untouched. Anything else
    /// happened while the address space was being rewritten.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ForkError::ChildCreationFailed(_))
    }

    /// The status a C-style `fork` would return for this error.
    pub fn into_isize(self) -> isize {
        match self {
            ForkError::InvariantViolation(_) => KernelError::Fault.into_isize(),
            ForkError::ResourceExhausted { error, .. } => error.into_isize(),
            ForkError::ChildCreationFailed(error) => error.into_isize(),
        }
    }
}

impl From<Violation> for ForkError {
    fn from(v: Violation) -> Self {
        ForkError::InvariantViolation(v)
    }
}

/// Map a failed system call `syscall` to [`ForkError::ResourceExhausted`].
pub(crate) fn exhausted(syscall: SyscallNumber) -> impl FnOnce(KernelError) -> ForkError {
    move |error| ForkError::ResourceExhausted { syscall, error }
}

impl core::fmt::Display for Violation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Violation::NotWriteFault { va, err } => {
                write!(f, "fault at {} is not a write (err {:?})", va, err)
            }
            Violation::NotCopyOnWrite { va, state } => {
                write!(f, "write fault at {} on a {:?} page", va, state)
            }
            Violation::ExceptionStackShared => {
                f.write_str("exception stack must not be shared")
            }
            Violation::ScratchPageInUse { va } => {
                write!(f, "{} is reserved for the fault handler", va)
            }
        }
    }
}

impl core::fmt::Display for ForkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ForkError::InvariantViolation(v) => write!(f, "{}", v),
            ForkError::ResourceExhausted { syscall, error } => {
                write!(f, "{:?}: {}", syscall, error)
            }
            ForkError::ChildCreationFailed(e) => write!(f, "exofork: {}", e),
        }
    }
}
