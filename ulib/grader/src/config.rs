//! Sizing of the simulated machine.

use crate::kernel::SimKernel;
use abyss::env::NENV;

/// Limits of a [`SimKernel`].
///
/// Both limits are hard: allocation past them fails the way the real kernel
/// fails when it runs dry, which makes exhaustion reproducible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimConfig {
    /// Number of physical frames user environments may hold at once.
    pub max_frames: usize,
    /// Number of environment slots, at most [`NENV`].
    pub max_envs: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_frames: 512,
            max_envs: NENV,
        }
    }
}

/// The [`SimKernelBuilder`] struct configures a [`SimKernel`] before it
/// boots.
///
/// Obtained from [`SimKernel::builder`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SimKernelBuilder {
    config: SimConfig,
}

impl SimKernelBuilder {
    /// Sets the number of physical frames.
    pub fn max_frames(mut self, n: usize) -> Self {
        self.config.max_frames = n;
        self
    }

    /// Sets the number of environment slots. Values above [`NENV`] are
    /// clamped.
    pub fn max_envs(mut self, n: usize) -> Self {
        self.config.max_envs = n.min(NENV);
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> SimConfig {
        self.config
    }

    /// Boot the kernel.
    pub fn build(self) -> SimKernel {
        SimKernel::with_config(self.config)
    }
}
