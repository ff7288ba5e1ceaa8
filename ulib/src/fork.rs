//! # `fork` with Copy-On-Write, in user space.
//!
//! [`fork`] creates a child environment whose address space is a logical
//! copy of the caller's. The child starts from the same point as the parent
//! and the only difference between the two is the value [`fork`] returns:
//! [`ForkOutcome::Parent`] with the child's identifier in the parent, and
//! [`ForkOutcome::Child`] in the child.
//!
//! No page is copied at fork time. Instead [`duppage`] decides, page by page,
//! how the child gets to see it:
//!
//! | State in the parent                  | Child gets              | Parent becomes |
//! |--------------------------------------|-------------------------|----------------|
//! | [`Absent`], [`KernelOnly`]           | nothing                 | unchanged      |
//! | [`SharedImmutable`]                  | same frame, same perms  | unchanged      |
//! | [`PrivateWritable`], [`CowShared`]   | same frame, `P+U+COW`   | `P+U+COW`      |
//!
//! The child is mapped before the parent is re-marked. Had the parent been
//! re-marked first, a write by the parent between the two calls would fault,
//! give the parent a private copy, and the child would then be mapped to the
//! copy instead of the frame the parent saw at fork time.
//!
//! The exception stack is the one writable page the two never share. Each
//! side needs a page to run its fault handler on, and a handler cannot run
//! on a stack that itself faults. The child gets a fresh one. A user page at
//! [`PFTEMP`], the fault handler's scratch address, is refused outright.
//!
//! Put together, the fork sequence is:
//! 1. Install the fault handler in the parent ([`set_pgfault_handler`]).
//! 2. Create a blank child ([`sys_exofork`]).
//! 3. In the child, fix up the identity and return.
//! 4. In the parent, run [`duppage`] over every page below the configured
//!    high-water mark.
//! 5. Give the child an exception stack and register its upcall.
//! 6. Mark the child runnable.
//!
//! A failure after step 2 leaves a half-built child behind. It is never
//! made runnable and the caller should treat the failure as fatal (see
//! [`ForkError::is_fatal`]).
//!
//! [`Absent`]: PageState::Absent
//! [`KernelOnly`]: PageState::KernelOnly
//! [`SharedImmutable`]: PageState::SharedImmutable
//! [`PrivateWritable`]: PageState::PrivateWritable
//! [`CowShared`]: PageState::CowShared

use crate::{
    env::Env,
    error::{ForkError, Violation, exhausted},
    page_table::{PTE_COW, PageState, pte_at},
    pgfault::{pgfault_upcall, set_pgfault_handler},
    syscall::{
        Upcall, sys_env_set_pgfault_upcall, sys_env_set_status, sys_exofork, sys_page_alloc,
        sys_page_map,
    },
};
use abyss::{
    EnvId, EnvStatus, PteFlags, SyscallNumber, Va,
    addressing::NPTENTRIES,
    memlayout::{PFTEMP, uxstack_page},
};

/// What [`fork`] returned to the environment that observes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkOutcome {
    /// We are the parent; `child` is the new environment.
    Parent {
        /// Identifier of the child.
        child: EnvId,
    },
    /// We are the child.
    Child,
}

/// Make virtual page `pn` of the caller visible to `child`.
///
/// See the [module documentation](self) for the policy. Pages the caller
/// does not map, or maps kernel-only, are skipped without a system call.
///
/// # Errors
/// - [`Violation::ExceptionStackShared`] for the exception stack page.
/// - [`Violation::ScratchPageInUse`] for a page mapped at
///   [`PFTEMP`], which the fault handler overwrites.
/// - [`ForkError::ResourceExhausted`] if a mapping fails. The page may then
///   be mapped in the child but not yet re-marked in the caller.
pub fn duppage(env: &Env<'_>, child: EnvId, pn: usize) -> Result<(), ForkError> {
    let Some(va) = Va::from_pn(pn) else {
        return Ok(());
    };
    let kernel = env.kernel();
    let pte = pte_at(kernel, va);
    let state = PageState::classify(pte);
    match state {
        PageState::Absent | PageState::KernelOnly => return Ok(()),
        _ if va == uxstack_page() => {
            log::error!("[{}] refusing to share the exception stack", env.id());
            return Err(Violation::ExceptionStackShared.into());
        }
        _ if va == PFTEMP => {
            log::error!("[{}] user page at the fault scratch address", env.id());
            return Err(Violation::ScratchPageInUse { va }.into());
        }
        PageState::PrivateWritable | PageState::CowShared => {
            let perm = PteFlags::P | PteFlags::U | PTE_COW;
            sys_page_map(kernel, EnvId::CURRENT, va, child, va, perm)
                .map_err(exhausted(SyscallNumber::PageMap))?;
            sys_page_map(kernel, EnvId::CURRENT, va, EnvId::CURRENT, va, perm)
                .map_err(exhausted(SyscallNumber::PageMap))?;
        }
        PageState::SharedImmutable => {
            let perm = pte.flags() & PteFlags::SYSCALL;
            sys_page_map(kernel, EnvId::CURRENT, va, child, va, perm)
                .map_err(exhausted(SyscallNumber::PageMap))?;
        }
    }
    log::trace!("[{}] {} -> {}: {:?}", env.id(), va, child, state);
    Ok(())
}

/// Create a copy-on-write child of `env`.
///
/// Returns [`ForkOutcome::Parent`] in the caller and [`ForkOutcome::Child`]
/// when the child first runs. In the child, `env` is updated to the child's
/// own identifier before this returns.
///
/// # Errors
/// - [`ForkError::ChildCreationFailed`] if no child could be created. Nothing
///   has changed in that case, besides the fault handler being installed.
/// - Anything [`duppage`] or the child's final setup fails with. These are
///   fatal to the caller.
pub fn fork(env: &mut Env<'_>) -> Result<ForkOutcome, ForkError> {
    set_pgfault_handler(env)?;

    let child = sys_exofork(env.kernel()).map_err(ForkError::ChildCreationFailed)?;
    if child.is_current() {
        env.refresh_identity()
            .map_err(exhausted(SyscallNumber::Getenvid))?;
        log::debug!("[{}] running as forked child", env.id());
        return Ok(ForkOutcome::Child);
    }

    log::debug!("[{}] fork: child {}", env.id(), child);
    populate(env, child).inspect_err(|e| {
        log::error!("[{}] fork of {} failed: {}", env.id(), child, e);
    })?;
    log::debug!("[{}] fork: child {} runnable", env.id(), child);
    Ok(ForkOutcome::Parent { child })
}

fn populate(env: &Env<'_>, child: EnvId) -> Result<(), ForkError> {
    let kernel = env.kernel();
    let end = env.config().pages().end;
    let mut pn = 0;
    while pn < end {
        let Some(va) = Va::from_pn(pn) else {
            break;
        };
        if !kernel.uvpd(va.pdx()).is_present() {
            // No page table: skip all of it.
            pn = (va.pdx() + 1) * NPTENTRIES;
            continue;
        }
        duppage(env, child, pn)?;
        pn += 1;
    }

    sys_page_alloc(
        kernel,
        child,
        uxstack_page(),
        PteFlags::P | PteFlags::U | PteFlags::W,
    )
    .map_err(exhausted(SyscallNumber::PageAlloc))?;
    let upcall: Upcall = pgfault_upcall;
    sys_env_set_pgfault_upcall(kernel, child, upcall)
        .map_err(exhausted(SyscallNumber::EnvSetPgfaultUpcall))?;
    sys_env_set_status(kernel, child, EnvStatus::Runnable)
        .map_err(exhausted(SyscallNumber::EnvSetStatus))?;
    Ok(())
}
