//! System call handlers of the simulated kernel.
//!
//! Each handler validates its arguments the way the real kernel does, in the
//! same order, and fails without side effects when a check does not pass.

use crate::kernel::State;
use abyss::{
    EnvId, EnvStatus, KernelError, PteFlags, SyscallNumber, Va, memlayout::UTOP,
};

/// A system call number and its arguments, as trapped from `caller`.
pub(crate) struct SyscallAbi {
    pub caller: EnvId,
    pub sysno: usize,
    pub arg1: usize,
    pub arg2: usize,
    pub arg3: usize,
    pub arg4: usize,
    pub arg5: usize,
}

impl SyscallAbi {
    pub(crate) fn new(caller: EnvId, sysno: usize, args: [usize; 5]) -> Self {
        let [arg1, arg2, arg3, arg4, arg5] = args;
        Self {
            caller,
            sysno,
            arg1,
            arg2,
            arg3,
            arg4,
            arg5,
        }
    }

    /// Encode the result the way it travels back to user space.
    pub(crate) fn return_value(&self, return_val: Result<usize, KernelError>) -> isize {
        match return_val {
            Ok(v) => v as isize,
            Err(e) => e.into_isize(),
        }
    }
}

fn envid(arg: usize) -> Result<EnvId, KernelError> {
    u32::try_from(arg)
        .map(EnvId::new)
        .map_err(|_| KernelError::BadEnv)
}

fn user_va(arg: usize) -> Result<Va, KernelError> {
    match Va::new(arg) {
        Some(va) if va < UTOP && va.is_page_aligned() => Ok(va),
        _ => Err(KernelError::InvalidArgument),
    }
}

fn user_perm(arg: usize) -> Result<PteFlags, KernelError> {
    PteFlags::from_bits(arg)
        .filter(|perm| perm.is_syscall_perm())
        .ok_or(KernelError::InvalidArgument)
}

impl State {
    pub(crate) fn dispatch(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        if self.envs.get(abi.caller).is_none() {
            return Err(KernelError::BadEnv);
        }
        SyscallNumber::try_from(abi.sysno)
            .map_err(|_| KernelError::InvalidArgument)
            .and_then(|no| {
                if let Some(e) = self.take_injected(no) {
                    return Err(e);
                }
                match no {
                    SyscallNumber::Getenvid => self.sys_getenvid(abi),
                    SyscallNumber::EnvDestroy => self.sys_env_destroy(abi),
                    SyscallNumber::PageAlloc => self.sys_page_alloc(abi),
                    SyscallNumber::PageMap => self.sys_page_map(abi),
                    SyscallNumber::PageUnmap => self.sys_page_unmap(abi),
                    SyscallNumber::Exofork => self.sys_exofork(abi),
                    SyscallNumber::EnvSetStatus => self.sys_env_set_status(abi),
                    SyscallNumber::EnvSetPgfaultUpcall => self.sys_env_set_pgfault_upcall(abi),
                }
            })
    }

    fn sys_getenvid(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        Ok(abi.caller.into_usize())
    }

    fn sys_env_destroy(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let env = self.envs.resolve(abi.caller, envid(abi.arg1)?, true)?;
        self.destroy(env);
        Ok(0)
    }

    fn sys_page_alloc(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let env = self.envs.resolve(abi.caller, envid(abi.arg1)?, true)?;
        let va = user_va(abi.arg2)?;
        let perm = user_perm(abi.arg3)?;
        let pa = self.frames.alloc()?;
        match self.insert(env, va, pa, perm) {
            Ok(()) => Ok(0),
            Err(e) => {
                self.frames.decref(pa);
                Err(e)
            }
        }
    }

    fn sys_page_map(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let src = self.envs.resolve(abi.caller, envid(abi.arg1)?, true)?;
        let dst = self.envs.resolve(abi.caller, envid(abi.arg3)?, true)?;
        let srcva = user_va(abi.arg2)?;
        let dstva = user_va(abi.arg4)?;
        let perm = user_perm(abi.arg5)?;
        let pte = self
            .envs
            .get(src)
            .ok_or(KernelError::BadEnv)?
            .space
            .pte(srcva.pn());
        let pa = pte.pa().ok_or(KernelError::InvalidArgument)?;
        if perm.contains(PteFlags::W) && !pte.flags().contains(PteFlags::W) {
            return Err(KernelError::InvalidArgument);
        }
        self.insert(dst, dstva, pa, perm)?;
        Ok(0)
    }

    fn sys_page_unmap(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let env = self.envs.resolve(abi.caller, envid(abi.arg1)?, true)?;
        let va = user_va(abi.arg2)?;
        self.remove(env, va)?;
        Ok(0)
    }

    fn sys_exofork(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let caller = self.envs.get_mut(abi.caller).ok_or(KernelError::BadEnv)?;
        if caller.pending_exofork {
            // The child's first run: it returns from its parent's exofork.
            caller.pending_exofork = false;
            return Ok(0);
        }
        let child = self.envs.alloc(abi.caller)?;
        child.pending_exofork = true;
        let id = child.id;
        log::info!("[{}] created by exofork from {}", id, abi.caller);
        Ok(id.into_usize())
    }

    fn sys_env_set_status(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let status = EnvStatus::try_from(abi.arg2)
            .ok()
            .filter(|s| matches!(s, EnvStatus::Runnable | EnvStatus::NotRunnable))
            .ok_or(KernelError::InvalidArgument)?;
        let env = self.envs.resolve(abi.caller, envid(abi.arg1)?, true)?;
        if let Some(env) = self.envs.get_mut(env) {
            env.status = status;
        }
        Ok(0)
    }

    fn sys_env_set_pgfault_upcall(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let env = self.envs.resolve(abi.caller, envid(abi.arg1)?, true)?;
        if let Some(env) = self.envs.get_mut(env) {
            env.upcall = Some(abi.arg2);
        }
        Ok(0)
    }
}
