//! Environment identifiers and run states.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// log2 of the size of the environment table.
pub const LOG2NENV: usize = 10;

/// Number of environment slots the kernel manages.
pub const NENV: usize = 1 << LOG2NENV;

/// Where the generation counter starts inside an [`EnvId`].
///
/// Each reuse of a slot bumps the generation by `1 << ENV_GEN_SHIFT`, so a
/// stale identifier for a recycled slot no longer names the new occupant.
pub const ENV_GEN_SHIFT: usize = 12;

/// An opaque, kernel-assigned handle naming an environment.
///
/// An identifier has three parts:
/// ```text
/// +1+---------------21-----------------+--------10--------+
/// |0|          Generation              | Environment Index|
/// +------------------------------------+------------------+
///                                       \--- envx(eid) --/
/// ```
///
/// The value `0` is never handed out. Passed to a system call, it is an alias
/// for "the calling environment" ([`EnvId::CURRENT`]).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(u32);

impl EnvId {
    /// The caller-relative alias.
    pub const CURRENT: Self = Self(0);

    /// Wrap a raw identifier.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw identifier.
    #[inline]
    pub const fn into_u32(self) -> u32 {
        self.0
    }

    /// The raw identifier, widened for a system call argument.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0 as usize
    }

    /// Index of this environment in the kernel's table.
    #[inline]
    pub const fn envx(self) -> usize {
        self.0 as usize & (NENV - 1)
    }

    /// Whether this is the caller-relative alias.
    #[inline]
    pub const fn is_current(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Debug for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// The run state of an environment.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum EnvStatus {
    /// The slot is unused.
    Free = 0,
    /// The environment is being torn down.
    Dying = 1,
    /// The environment may be scheduled.
    Runnable = 2,
    /// The environment is currently on a CPU.
    Running = 3,
    /// The environment exists but must not be scheduled, e.g. a child whose
    /// address space is still being built.
    NotRunnable = 4,
}
