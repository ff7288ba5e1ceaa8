//! Error codes returned by the kernel.

/// Enum representing errors that can occur during a kernel operation.
///
/// A system call that fails returns the negated code of one of these
/// variants in place of its result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// Unspecified or unknown problem. (E_UNSPECIFIED)
    Unspecified,
    /// Environment doesn't exist or otherwise cannot be used in the requested
    /// action. (E_BAD_ENV)
    BadEnv,
    /// Invalid parameter. (E_INVAL)
    InvalidArgument,
    /// Request failed due to memory shortage. (E_NO_MEM)
    NoMemory,
    /// Attempt to create a new environment beyond the maximum allowed.
    /// (E_NO_FREE_ENV)
    NoFreeEnv,
    /// Memory fault. (E_FAULT)
    Fault,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into the negative status a system
    /// call returns.
    pub const fn into_isize(self) -> isize {
        match self {
            KernelError::Unspecified => -1,
            KernelError::BadEnv => -2,
            KernelError::InvalidArgument => -3,
            KernelError::NoMemory => -4,
            KernelError::NoFreeEnv => -5,
            KernelError::Fault => -6,
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            KernelError::Unspecified => "unspecified error",
            KernelError::BadEnv => "bad environment",
            KernelError::InvalidArgument => "invalid parameter",
            KernelError::NoMemory => "out of memory",
            KernelError::NoFreeEnv => "out of environments",
            KernelError::Fault => "segmentation fault",
        })
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    /// The value that failed to decode.
    pub e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Unspecified),
            -2 => Ok(Self::BadEnv),
            -3 => Ok(Self::InvalidArgument),
            -4 => Ok(Self::NoMemory),
            -5 => Ok(Self::NoFreeEnv),
            -6 => Ok(Self::Fault),
            e => Err(TryFromError { e }),
        }
    }
}
