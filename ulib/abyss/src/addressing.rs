//! Physical and Virtual Memory Addressing Schemes.
//!
//! The machine is a 32-bit, two-level paged machine: a virtual address is
//! split into a page directory index, a page table index and an offset.
//!
//! ```text
//! 31                    22 21                    12 11                    0
//! +-----------------------+-----------------------+-----------------------+
//! |  Page Directory Index |    Page Table Index   |  Offset within Page   |
//! +-----------------------+-----------------------+-----------------------+
//!  \------- pdx(va) -----/ \------- ptx(va) -----/
//!  \---------------- pn(va) ---------------------/
//! ```
//!
//! [`Va`] and [`Pa`] wrap raw `usize` addresses so that a virtual address can
//! never be handed to something that expects a frame address, and the other
//! way around. Both support the arithmetic needed for page walks.

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page number from a given address.
pub const PAGE_SHIFT: usize = 12; // 12 bits (log2 of 4 KB)

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// The shift amount to get the page directory index from a given address.
pub const PDX_SHIFT: usize = 22;

/// Page table entries per page table.
pub const NPTENTRIES: usize = 1024;

/// Page directory entries per page directory.
pub const NPDENTRIES: usize = 1024;

/// Bytes mapped by a single page directory entry.
pub const PT_SIZE: usize = PAGE_SIZE * NPTENTRIES;

/// Highest representable address on the 32-bit machine.
const ADDR_MAX: usize = 0xffff_ffff;

/// Represents a physical address.
///
/// A [`Pa`] names a byte of physical memory. User code never dereferences
/// one; it only shows up inside page table entries, where it identifies the
/// frame a virtual page is backed by.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(pub(crate) usize);

impl Pa {
    /// Creates a new physical address if the address fits the machine.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr <= ADDR_MAX {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the physical address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up to the physical address to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the page offset from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// The [`Va`] (Virtual Address) struct represents an address in the virtual
/// memory space of a single environment. The same [`Va`] may be backed by
/// different frames in different environments, and by the same frame in two
/// environments that share a page.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(pub(crate) usize);

impl Va {
    /// Creates a new virtual address if the address fits the machine.
    ///
    /// # Returns
    /// - `Some(Va)`: If the address is within the 32-bit address space.
    /// - `None`: If the address is invalid.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr <= ADDR_MAX {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// The first address of virtual page number `pn`.
    ///
    /// Returns `None` if `pn` lies beyond the address space.
    #[inline]
    pub const fn from_pn(pn: usize) -> Option<Self> {
        if pn < NPDENTRIES * NPTENTRIES {
            Some(Self(pn << PAGE_SHIFT))
        } else {
            None
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Whether the address sits on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    /// The virtual page number of this address.
    ///
    /// This is the index used to look the page up in the linear
    /// `uvpt` window.
    #[inline]
    pub const fn pn(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// The page directory index of this address.
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> PDX_SHIFT) & (NPDENTRIES - 1)
    }

    /// The page table index of this address.
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 >> PAGE_SHIFT) & (NPTENTRIES - 1)
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 += other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:08x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:08x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
