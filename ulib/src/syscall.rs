//! # System calls from user space.
//!
//! An environment talks to the kernel by trapping with a system call number
//! and up to five arguments; the kernel answers with a single signed word.
//! A negative answer is a negated [`KernelError`] code. The trap itself
//! (moving arguments into registers and crossing into the kernel) lives
//! behind the [`Kernel`] trait, together with the two other things user code
//! gets "for free" from the machine: the read-only window onto its own page
//! table, and plain loads and stores to its own memory.
//!
//! The `sys_*` functions below are the only way the rest of this crate
//! reaches the kernel. Each encodes its arguments, traps, and decodes the
//! answer into a `Result`.

use abyss::{
    EnvId, EnvStatus, KernelError, Pde, Pte, PteFlags, SyscallNumber, UTrapframe, Va,
};

/// The kernel, as seen from inside one environment.
///
/// Every method acts on behalf of the calling environment; there is no way
/// to name "the current process" other than by being it.
pub trait Kernel {
    /// Trap into the kernel with system call `no` and its arguments.
    ///
    /// Returns the raw answer. Unused argument slots are zero.
    fn syscall(&self, no: SyscallNumber, args: [usize; 5]) -> isize;

    /// Read page directory entry `pdx` of the caller's page table.
    fn uvpd(&self, pdx: usize) -> Pde;

    /// Read the page table entry of virtual page `pn`.
    ///
    /// Only meaningful when the covering page directory entry is present;
    /// see [`page_table::pte_at`].
    ///
    /// [`page_table::pte_at`]: crate::page_table::pte_at
    fn uvpt(&self, pn: usize) -> Pte;

    /// Copy `len` bytes from `src` to `dst` in the caller's address space.
    ///
    /// # Safety
    /// The whole of `src..src + len` must be mapped readable and the whole of
    /// `dst..dst + len` mapped writable in the calling environment.
    unsafe fn memmove(&self, dst: Va, src: Va, len: usize);
}

/// Entry point the kernel transfers to when an environment page faults.
///
/// The address of an [`Upcall`] is what [`sys_env_set_pgfault_upcall`]
/// registers.
pub type Upcall = fn(&dyn Kernel, &UTrapframe);

fn syscall(
    kernel: &dyn Kernel,
    no: SyscallNumber,
    check: bool,
    args: [usize; 5],
) -> Result<usize, KernelError> {
    let ret = kernel.syscall(no, args);
    if ret < 0 {
        let e = KernelError::try_from(ret).unwrap_or(KernelError::Unspecified);
        log::debug!("syscall {:?} failed: {}", no, e);
        Err(e)
    } else if check && ret > 0 {
        log::error!("syscall {:?} returned {} (> 0)", no, ret);
        Err(KernelError::Unspecified)
    } else {
        Ok(ret as usize)
    }
}

fn into_envid(raw: usize) -> Result<EnvId, KernelError> {
    u32::try_from(raw)
        .map(EnvId::new)
        .map_err(|_| KernelError::Unspecified)
}

/// Returns the identifier of the calling environment.
pub fn sys_getenvid(kernel: &dyn Kernel) -> Result<EnvId, KernelError> {
    syscall(kernel, SyscallNumber::Getenvid, false, [0; 5]).and_then(into_envid)
}

/// Destroys environment `env`, which may be the caller.
pub fn sys_env_destroy(kernel: &dyn Kernel, env: EnvId) -> Result<(), KernelError> {
    syscall(
        kernel,
        SyscallNumber::EnvDestroy,
        true,
        [env.into_usize(), 0, 0, 0, 0],
    )
    .map(|_| ())
}

/// Allocates a zeroed page and maps it at `va` in `env` with `perm`.
///
/// Any page already mapped at `va` is unmapped first.
pub fn sys_page_alloc(
    kernel: &dyn Kernel,
    env: EnvId,
    va: Va,
    perm: PteFlags,
) -> Result<(), KernelError> {
    syscall(
        kernel,
        SyscallNumber::PageAlloc,
        true,
        [env.into_usize(), va.into_usize(), perm.bits(), 0, 0],
    )
    .map(|_| ())
}

/// Maps the frame at `srcva` in `srcenv` at `dstva` in `dstenv` with `perm`.
///
/// The new mapping replaces whatever was mapped at `dstva`, permissions
/// included. Nothing of the old entry's flags survives.
pub fn sys_page_map(
    kernel: &dyn Kernel,
    srcenv: EnvId,
    srcva: Va,
    dstenv: EnvId,
    dstva: Va,
    perm: PteFlags,
) -> Result<(), KernelError> {
    syscall(
        kernel,
        SyscallNumber::PageMap,
        true,
        [
            srcenv.into_usize(),
            srcva.into_usize(),
            dstenv.into_usize(),
            dstva.into_usize(),
            perm.bits(),
        ],
    )
    .map(|_| ())
}

/// Unmaps the page at `va` in `env`. Unmapping nothing is not an error.
pub fn sys_page_unmap(kernel: &dyn Kernel, env: EnvId, va: Va) -> Result<(), KernelError> {
    syscall(
        kernel,
        SyscallNumber::PageUnmap,
        true,
        [env.into_usize(), va.into_usize(), 0, 0, 0],
    )
    .map(|_| ())
}

/// Creates a child with an empty address space that is not yet runnable.
///
/// Returns the child's identifier in the parent, and [`EnvId::CURRENT`] in
/// the child once it first runs.
pub fn sys_exofork(kernel: &dyn Kernel) -> Result<EnvId, KernelError> {
    syscall(kernel, SyscallNumber::Exofork, false, [0; 5]).and_then(into_envid)
}

/// Sets the run state of `env` to `status`.
pub fn sys_env_set_status(
    kernel: &dyn Kernel,
    env: EnvId,
    status: EnvStatus,
) -> Result<(), KernelError> {
    syscall(
        kernel,
        SyscallNumber::EnvSetStatus,
        true,
        [env.into_usize(), status.into(), 0, 0, 0],
    )
    .map(|_| ())
}

/// Registers `upcall` as the page fault entry point of `env`.
pub fn sys_env_set_pgfault_upcall(
    kernel: &dyn Kernel,
    env: EnvId,
    upcall: Upcall,
) -> Result<(), KernelError> {
    syscall(
        kernel,
        SyscallNumber::EnvSetPgfaultUpcall,
        true,
        [env.into_usize(), upcall as usize, 0, 0, 0],
    )
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Answers every trap with a fixed value and remembers what it was asked.
    struct Canned {
        answer: isize,
        calls: RefCell<Vec<(SyscallNumber, [usize; 5])>>,
    }

    impl Canned {
        fn new(answer: isize) -> Self {
            Self {
                answer,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Kernel for Canned {
        fn syscall(&self, no: SyscallNumber, args: [usize; 5]) -> isize {
            self.calls.borrow_mut().push((no, args));
            self.answer
        }
        fn uvpd(&self, _pdx: usize) -> Pde {
            Pde::EMPTY
        }
        fn uvpt(&self, _pn: usize) -> Pte {
            Pte::EMPTY
        }
        unsafe fn memmove(&self, _dst: Va, _src: Va, _len: usize) {}
    }

    #[test]
    fn negative_answer_is_kernel_error() {
        let k = Canned::new(-4);
        let va = Va::new(0x0080_0000).unwrap();
        assert_eq!(
            sys_page_alloc(&k, EnvId::CURRENT, va, PteFlags::P | PteFlags::U),
            Err(KernelError::NoMemory)
        );
        assert_eq!(
            k.calls.borrow()[0],
            (SyscallNumber::PageAlloc, [0, 0x0080_0000, 0b101, 0, 0])
        );
    }

    #[test]
    fn unknown_negative_answer_is_unspecified() {
        let k = Canned::new(-77);
        assert_eq!(sys_exofork(&k), Err(KernelError::Unspecified));
    }

    #[test]
    fn checked_call_rejects_positive_answer() {
        let k = Canned::new(1);
        let va = Va::new(0x0080_0000).unwrap();
        assert_eq!(
            sys_page_unmap(&k, EnvId::CURRENT, va),
            Err(KernelError::Unspecified)
        );
    }

    #[test]
    fn unchecked_calls_return_identifiers() {
        let k = Canned::new(0x1001);
        assert_eq!(sys_getenvid(&k), Ok(EnvId::new(0x1001)));
        assert_eq!(sys_exofork(&k), Ok(EnvId::new(0x1001)));
        assert_eq!(sys_exofork(&Canned::new(0)), Ok(EnvId::CURRENT));
    }

    #[test]
    fn map_passes_both_sides() {
        let k = Canned::new(0);
        let va = Va::new(0x0080_1000).unwrap();
        let child = EnvId::new(0x1002);
        sys_page_map(&k, EnvId::CURRENT, va, child, va, PteFlags::P | PteFlags::U).unwrap();
        assert_eq!(
            k.calls.borrow()[0],
            (SyscallNumber::PageMap, [0, 0x0080_1000, 0x1002, 0x0080_1000, 0b101])
        );
    }
}
