//! Tunables of [`fork`](crate::fork()).

use abyss::{
    KernelError, Va,
    memlayout::{USTACKTOP, uxstack_page},
};

/// How much of the address space [`fork`](crate::fork()) walks.
///
/// The walk covers every page below the high-water mark. The default mark is
/// [`USTACKTOP`], which takes in program text, data, heap and the normal
/// stack. The exception stack page is never part of the walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForkConfig {
    high_water_mark: Va,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            high_water_mark: USTACKTOP,
        }
    }
}

impl ForkConfig {
    /// Walk only pages below `va`.
    ///
    /// Fails with [`KernelError::InvalidArgument`] if `va` is not page
    /// aligned or would let the walk reach the exception stack. Round a
    /// program's end symbol up with [`Va::page_up`] before passing it in.
    pub fn with_high_water_mark(self, va: Va) -> Result<Self, KernelError> {
        if !va.is_page_aligned() || va > uxstack_page() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            high_water_mark: va,
        })
    }

    /// The first address the walk does not cover.
    #[inline]
    pub fn high_water_mark(&self) -> Va {
        self.high_water_mark
    }

    /// Virtual page numbers the walk visits.
    #[inline]
    pub fn pages(&self) -> core::ops::Range<usize> {
        0..self.high_water_mark.pn()
    }
}
