//! # Copy-on-write fault repair.
//!
//! When an environment writes to a page marked [`PTE_COW`], the processor
//! faults and the kernel transfers control to the environment's registered
//! [`Upcall`], running on the exception stack. The kernel does not look at
//! the fault at all; repairing it is entirely up to the environment.
//!
//! The repair works as follows:
//! 1. Make sure the fault is a write to a [`PageState::CowShared`] page.
//!    Anything else is a genuine bug in the program and is not repaired.
//! 2. Allocate a fresh page at the scratch address [`PFTEMP`].
//! 3. Copy the faulting page's contents into it.
//! 4. Map the fresh page over the faulting page, writable and without
//!    [`PTE_COW`]. This drops the reference to the shared frame.
//! 5. Unmap the scratch address.
//!
//! Other environments still mapping the old frame are not touched. The last
//! one to write to it repairs its fault the same way and the old frame is
//! freed once nobody maps it.
//!
//! [`PFTEMP`]: abyss::memlayout::PFTEMP

use crate::{
    env::Env,
    error::{ForkError, Violation, exhausted},
    page_table::{PTE_COW, PageState},
    syscall::{
        Kernel, Upcall, sys_env_destroy, sys_env_set_pgfault_upcall, sys_page_alloc,
        sys_page_map, sys_page_unmap,
    },
};
#[cfg(doc)]
use abyss::memlayout::UXSTACKTOP;
use abyss::{
    EnvId, PAGE_SIZE, PteFlags, SyscallNumber, UTrapframe,
    memlayout::{PFTEMP, uxstack_page},
};

/// Repair a copy-on-write fault described by `utf`.
///
/// On success, the faulting page is mapped writable and private in the
/// calling environment, with the same contents it had before the fault.
pub fn pgfault(kernel: &dyn Kernel, utf: &UTrapframe) -> Result<(), ForkError> {
    let va = utf.fault_va;
    if !utf.is_write() {
        return Err(Violation::NotWriteFault { va, err: utf.err }.into());
    }
    let state = PageState::of(kernel, va);
    if state != PageState::CowShared {
        return Err(Violation::NotCopyOnWrite { va, state }.into());
    }
    let origin = va.page_down();
    if origin == PFTEMP {
        return Err(Violation::ScratchPageInUse { va }.into());
    }

    let perm = PteFlags::P | PteFlags::U | PteFlags::W;
    sys_page_alloc(kernel, EnvId::CURRENT, PFTEMP, perm)
        .map_err(exhausted(SyscallNumber::PageAlloc))?;
    // SAFETY: `origin` was just found present and user-readable, and PFTEMP
    // was just mapped writable.
    unsafe { kernel.memmove(PFTEMP, origin, PAGE_SIZE) };
    sys_page_map(kernel, EnvId::CURRENT, PFTEMP, EnvId::CURRENT, origin, perm)
        .map_err(exhausted(SyscallNumber::PageMap))?;
    sys_page_unmap(kernel, EnvId::CURRENT, PFTEMP)
        .map_err(exhausted(SyscallNumber::PageUnmap))?;

    log::debug!("copied {} on write", origin);
    Ok(())
}

/// The page fault entry point registered with the kernel.
///
/// Runs [`pgfault`]. A fault it cannot repair is fatal to the environment,
/// which destroys itself.
#[inline(never)]
pub fn pgfault_upcall(kernel: &dyn Kernel, utf: &UTrapframe) {
    if let Err(e) = pgfault(kernel, utf) {
        log::error!("unrecoverable page fault at {}: {}", utf.fault_va, e);
        if let Err(e) = sys_env_destroy(kernel, EnvId::CURRENT) {
            log::error!("env_destroy after fault failed: {}", e);
        }
    }
}

/// Make sure `env` will run [`pgfault_upcall`] on a page fault.
///
/// Allocates the exception stack page below [`UXSTACKTOP`] unless it is
/// already a private writable page, then registers the upcall. Calling this
/// again is harmless.
pub fn set_pgfault_handler(env: &Env<'_>) -> Result<(), ForkError> {
    let kernel = env.kernel();
    if PageState::of(kernel, uxstack_page()) != PageState::PrivateWritable {
        sys_page_alloc(
            kernel,
            EnvId::CURRENT,
            uxstack_page(),
            PteFlags::P | PteFlags::U | PteFlags::W,
        )
        .map_err(exhausted(SyscallNumber::PageAlloc))?;
    }
    let upcall: Upcall = pgfault_upcall;
    sys_env_set_pgfault_upcall(kernel, EnvId::CURRENT, upcall)
        .map_err(exhausted(SyscallNumber::EnvSetPgfaultUpcall))?;
    log::debug!("[{}] page fault handler installed", env.id());
    Ok(())
}

// The COW bit must survive a trip through a mapping system call.
const _: () = assert!(PTE_COW.bits() & PteFlags::SYSCALL.bits() == PTE_COW.bits());
