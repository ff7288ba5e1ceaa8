//! System call numbers.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Represents system call numbers understood by the kernel.
///
/// The number travels in the first register of the trap; up to five
/// arguments follow it. Numbers not listed here are answered with
/// [`KernelError::InvalidArgument`].
///
/// [`KernelError::InvalidArgument`]: crate::KernelError::InvalidArgument
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
pub enum SyscallNumber {
    /// Returns the identifier of the calling environment.
    Getenvid = 2,
    /// Destroys an environment.
    EnvDestroy = 3,
    /// Allocates a zeroed page and maps it.
    PageAlloc = 4,
    /// Maps an existing frame at another (environment, address) pair.
    PageMap = 5,
    /// Removes a mapping.
    PageUnmap = 6,
    /// Creates a blank, not-yet-runnable child environment.
    Exofork = 7,
    /// Changes the run state of an environment.
    EnvSetStatus = 8,
    /// Registers the page fault upcall of an environment.
    EnvSetPgfaultUpcall = 9,
}
