//! The calling environment.

use crate::{
    config::ForkConfig,
    syscall::{Kernel, sys_env_destroy, sys_getenvid},
};
use abyss::{EnvId, KernelError};

/// The environment the code is running in.
///
/// Carries the kernel seam, this environment's identifier and the fork
/// tunables. There is no global "current environment"; every operation that
/// needs one takes an [`Env`].
///
/// A forked child starts out with a copy of its parent's [`Env`], stale
/// identifier included, until [`fork`](crate::fork()) fixes it up.
#[derive(Clone)]
pub struct Env<'k> {
    kernel: &'k dyn Kernel,
    id: EnvId,
    config: ForkConfig,
}

impl<'k> Env<'k> {
    /// Ask the kernel who we are.
    pub fn new(kernel: &'k dyn Kernel) -> Result<Self, KernelError> {
        let id = sys_getenvid(kernel)?;
        Ok(Self {
            kernel,
            id,
            config: ForkConfig::default(),
        })
    }

    /// Replace the fork tunables.
    pub fn with_config(mut self, config: ForkConfig) -> Self {
        self.config = config;
        self
    }

    /// The kernel, as seen from this environment.
    #[inline]
    pub fn kernel(&self) -> &'k dyn Kernel {
        self.kernel
    }

    /// Identifier of this environment, as last learned from the kernel.
    #[inline]
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// The fork tunables.
    #[inline]
    pub fn config(&self) -> &ForkConfig {
        &self.config
    }

    /// Learn our identifier again.
    ///
    /// A freshly forked child runs with a copy of its parent's memory, so the
    /// identifier it finds there is the parent's.
    pub fn refresh_identity(&mut self) -> Result<EnvId, KernelError> {
        self.id = sys_getenvid(self.kernel)?;
        Ok(self.id)
    }

    /// Destroy this environment.
    pub fn exit(&self) -> Result<(), KernelError> {
        sys_env_destroy(self.kernel, EnvId::CURRENT)
    }
}

impl core::fmt::Debug for Env<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Env")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
