//! The simulated machine.

use crate::{
    config::{SimConfig, SimKernelBuilder},
    env::EnvTable,
    frame::FrameTable,
    syscall::SyscallAbi,
};
use abyss::{
    EnvId, EnvStatus, FaultErrorCode, KernelError, PAGE_SIZE, Pa, Pde, Pte, PteFlags,
    SyscallNumber, UTrapframe, Va,
    memlayout::{UTOP, uxstack_page},
};
use std::cell::{Cell, RefCell};
use ulib::{Kernel, Upcall, pgfault::pgfault_upcall};

/// One system call, as the kernel saw it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallRecord {
    /// The calling environment.
    pub caller: EnvId,
    /// The raw system call number.
    pub sysno: usize,
    /// The arguments.
    pub args: [usize; 5],
    /// What the kernel answered.
    pub ret: isize,
}

impl SyscallRecord {
    /// Whether this is a call to `no`.
    pub fn is(&self, no: SyscallNumber) -> bool {
        self.sysno == usize::from(no)
    }

    /// Whether the kernel answered with an error.
    pub fn failed(&self) -> bool {
        self.ret < 0
    }
}

/// One page fault the kernel delivered (or tried to).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    /// The faulting environment.
    pub env: EnvId,
    /// The fault.
    pub utf: UTrapframe,
}

/// Outcome of a memory access that could not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimFault {
    /// The access faulted and the environment was destroyed.
    Destroyed(UTrapframe),
    /// There is no live environment to perform the access.
    NotRunning,
}

impl core::fmt::Display for SimFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SimFault::Destroyed(utf) => write!(
                f,
                "environment destroyed by fault at {} ({:?})",
                utf.fault_va, utf.err
            ),
            SimFault::NotRunning => f.write_str("no environment is running"),
        }
    }
}

pub(crate) struct State {
    pub frames: FrameTable,
    pub envs: EnvTable,
    pub upcalls: Vec<Upcall>,
    pub injected: Vec<(SyscallNumber, KernelError)>,
    pub syscall_log: Vec<SyscallRecord>,
    pub fault_log: Vec<FaultRecord>,
}

impl State {
    /// Map `pa` at `va` in `env`, replacing what was there.
    pub(crate) fn insert(
        &mut self,
        env: EnvId,
        va: Va,
        pa: Pa,
        flags: PteFlags,
    ) -> Result<(), KernelError> {
        let slot = self.envs.get_mut(env).ok_or(KernelError::BadEnv)?;
        // Reference first: re-inserting the frame already mapped at `va`
        // must not free it.
        self.frames.incref(pa);
        if let Some(old) = slot.space.insert(va, Pte::new(pa, flags)).and_then(|p| p.pa()) {
            self.frames.decref(old);
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, env: EnvId, va: Va) -> Result<(), KernelError> {
        let slot = self.envs.get_mut(env).ok_or(KernelError::BadEnv)?;
        if let Some(old) = slot.space.remove(va).and_then(|p| p.pa()) {
            self.frames.decref(old);
        }
        Ok(())
    }

    /// Tear `env` down and release every frame it maps.
    pub(crate) fn destroy(&mut self, env: EnvId) {
        if let Some(mut slot) = self.envs.remove(env) {
            for pa in slot.space.take().into_iter().filter_map(|pte| pte.pa()) {
                self.frames.decref(pa);
            }
            log::info!(
                "[{}] destroyed, {} frames in use",
                env,
                self.frames.in_use()
            );
        }
    }

    pub(crate) fn take_injected(&mut self, no: SyscallNumber) -> Option<KernelError> {
        let pos = self.injected.iter().position(|(n, _)| *n == no)?;
        Some(self.injected.remove(pos).1)
    }

    fn resolve_upcall(&self, addr: usize) -> Option<Upcall> {
        self.upcalls.iter().copied().find(|u| *u as usize == addr)
    }
}

/// A kernel running user environments on the host.
///
/// [`SimKernel`] implements [`Kernel`] on behalf of whichever environment is
/// running, see [`SimKernel::run`]. Memory accesses through
/// [`SimKernel::read`] and [`SimKernel::write`] go through that
/// environment's page table and deliver page faults to its upcall the way
/// the real kernel does.
pub struct SimKernel {
    state: RefCell<State>,
    current: Cell<Option<EnvId>>,
    config: SimConfig,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SimKernel {
    /// Start configuring a kernel.
    pub fn builder() -> SimKernelBuilder {
        SimKernelBuilder::default()
    }

    pub(crate) fn with_config(config: SimConfig) -> Self {
        let default_upcall: Upcall = pgfault_upcall;
        Self {
            state: RefCell::new(State {
                frames: FrameTable::new(config.max_frames),
                envs: EnvTable::new(config.max_envs),
                upcalls: vec![default_upcall],
                injected: Vec::new(),
                syscall_log: Vec::new(),
                fault_log: Vec::new(),
            }),
            current: Cell::new(None),
            config,
        }
    }

    /// The configuration this kernel booted with.
    pub fn config(&self) -> SimConfig {
        self.config
    }

    /// Create a runnable environment with an empty address space and no
    /// parent.
    pub fn create_env(&self) -> Result<EnvId, KernelError> {
        let mut st = self.state.borrow_mut();
        let env = st.envs.alloc(EnvId::CURRENT)?;
        env.status = EnvStatus::Runnable;
        let id = env.id;
        log::info!("[{}] created", id);
        Ok(id)
    }

    /// Map a fresh frame holding `bytes` at `va` in `env`.
    ///
    /// This is a loader operation, so `perm` is not restricted to what a
    /// system call may ask for. It only has to contain [`PteFlags::P`].
    pub fn load_page(
        &self,
        env: EnvId,
        va: Va,
        perm: PteFlags,
        bytes: &[u8],
    ) -> Result<(), KernelError> {
        if !va.is_page_aligned() || va >= UTOP || !perm.contains(PteFlags::P) {
            return Err(KernelError::InvalidArgument);
        }
        if bytes.len() > PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let mut st = self.state.borrow_mut();
        if st.envs.get(env).is_none() {
            return Err(KernelError::BadEnv);
        }
        let pa = st.frames.alloc()?;
        if let Some(frame) = st.frames.bytes_mut(pa) {
            frame[..bytes.len()].copy_from_slice(bytes);
        }
        st.insert(env, va, pa, perm)
    }

    /// Make `upcall` resolvable as a page fault entry point.
    ///
    /// [`pgfault_upcall`] is always known.
    pub fn register_upcall(&self, upcall: Upcall) {
        self.state.borrow_mut().upcalls.push(upcall);
    }

    /// Switch to environment `id`.
    ///
    /// The previously running environment goes back to runnable. Fails with
    /// [`KernelError::BadEnv`] if `id` does not exist and
    /// [`KernelError::InvalidArgument`] if it is not runnable.
    pub fn run(&self, id: EnvId) -> Result<(), KernelError> {
        let mut st = self.state.borrow_mut();
        let status = st.envs.get(id).ok_or(KernelError::BadEnv)?.status;
        if !matches!(status, EnvStatus::Runnable | EnvStatus::Running) {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(prev) = self.current.get() {
            if let Some(prev) = st.envs.get_mut(prev) {
                if prev.status == EnvStatus::Running {
                    prev.status = EnvStatus::Runnable;
                }
            }
        }
        if let Some(env) = st.envs.get_mut(id) {
            env.status = EnvStatus::Running;
        }
        self.current.set(Some(id));
        log::debug!("[{}] running", id);
        Ok(())
    }

    /// The environment [`Kernel`] calls act for, if it is still alive.
    pub fn current(&self) -> Option<EnvId> {
        let id = self.current.get()?;
        self.state.borrow().envs.get(id).map(|env| env.id)
    }

    fn running(&self) -> Result<EnvId, SimFault> {
        self.current().ok_or(SimFault::NotRunning)
    }

    /// Read `len` bytes at `va` as the running environment.
    pub fn read(&self, va: Va, len: usize) -> Result<Vec<u8>, SimFault> {
        let id = self.running()?;
        let mut out = Vec::with_capacity(len);
        self.access(id, va, len, false, |frame, offset, n, _| {
            out.extend_from_slice(&frame[offset..offset + n]);
        })?;
        Ok(out)
    }

    /// Write `bytes` at `va` as the running environment.
    pub fn write(&self, va: Va, bytes: &[u8]) -> Result<(), SimFault> {
        let id = self.running()?;
        self.access(id, va, bytes.len(), true, |frame, offset, n, done| {
            frame[offset..offset + n].copy_from_slice(&bytes[done..done + n]);
        })
    }

    fn access(
        &self,
        id: EnvId,
        va: Va,
        len: usize,
        write: bool,
        mut f: impl FnMut(&mut [u8; PAGE_SIZE], usize, usize, usize),
    ) -> Result<(), SimFault> {
        let mut done = 0;
        while done < len {
            let at = va + done;
            let n = (PAGE_SIZE - at.offset()).min(len - done);
            let pa = self.access_page(id, at, write)?;
            if let Some(frame) = self.state.borrow_mut().frames.bytes_mut(pa) {
                f(frame, at.offset(), n, done);
            }
            done += n;
        }
        Ok(())
    }

    /// Find the frame behind `va`, delivering at most one page fault.
    fn access_page(&self, id: EnvId, va: Va, write: bool) -> Result<Pa, SimFault> {
        let mut delivered = false;
        loop {
            let utf = {
                let st = self.state.borrow();
                let env = st.envs.get(id).ok_or(SimFault::NotRunning)?;
                let pte = env.space.pte(va.pn());
                let mut needed = PteFlags::P | PteFlags::U;
                if write {
                    needed |= PteFlags::W;
                }
                match pte.pa() {
                    Some(pa) if pte.flags().contains(needed) => return Ok(pa),
                    _ => {}
                }
                let mut err = FaultErrorCode::USER;
                if pte.flags().contains(PteFlags::P) {
                    err |= FaultErrorCode::PRESENT;
                }
                if write {
                    err |= FaultErrorCode::WRITE;
                }
                UTrapframe { fault_va: va, err }
            };
            if delivered {
                self.kill(id, &utf, "fault persists after upcall");
                return Err(SimFault::Destroyed(utf));
            }
            self.deliver(id, utf)?;
            delivered = true;
        }
    }

    /// Run the upcall of `id` for `utf`.
    fn deliver(&self, id: EnvId, utf: UTrapframe) -> Result<(), SimFault> {
        let upcall = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            st.fault_log.push(FaultRecord { env: id, utf });
            log::debug!("[{}] page fault at {} ({:?})", id, utf.fault_va, utf.err);
            let upcall = st
                .envs
                .get(id)
                .and_then(|env| env.upcall)
                .and_then(|addr| st.resolve_upcall(addr));
            let env = st.envs.get_mut(id).ok_or(SimFault::NotRunning)?;
            let stack = env.space.pte(uxstack_page().pn()).flags();
            match upcall {
                None => Err("no page fault upcall"),
                Some(_) if !stack.contains(PteFlags::P | PteFlags::U | PteFlags::W) => {
                    Err("exception stack is not writable")
                }
                Some(_) if env.in_upcall => Err("fault inside the page fault upcall"),
                Some(upcall) => {
                    env.in_upcall = true;
                    Ok(upcall)
                }
            }
        };
        let upcall = match upcall {
            Ok(upcall) => upcall,
            Err(reason) => {
                self.kill(id, &utf, reason);
                return Err(SimFault::Destroyed(utf));
            }
        };

        upcall(self, &utf);

        match self.state.borrow_mut().envs.get_mut(id) {
            Some(env) => {
                env.in_upcall = false;
                Ok(())
            }
            None => Err(SimFault::Destroyed(utf)),
        }
    }

    fn kill(&self, id: EnvId, utf: &UTrapframe, reason: &str) {
        log::info!("[{}] killed by fault at {}: {}", id, utf.fault_va, reason);
        self.state.borrow_mut().destroy(id);
    }

    /// Issue a system call as `caller`.
    ///
    /// Unknown numbers are answered with [`KernelError::InvalidArgument`].
    pub fn syscall_raw(&self, caller: EnvId, sysno: usize, args: [usize; 5]) -> isize {
        let mut st = self.state.borrow_mut();
        let abi = SyscallAbi::new(caller, sysno, args);
        let result = st.dispatch(&abi);
        if let Err(e) = result {
            log::debug!("[{}] syscall {} failed: {}", caller, sysno, e);
        }
        let ret = abi.return_value(result);
        st.syscall_log.push(SyscallRecord {
            caller,
            sysno,
            args,
            ret,
        });
        ret
    }

    /// Make the next call to `no`, from any environment, fail with `err`
    /// without side effects.
    pub fn fail_next(&self, no: SyscallNumber, err: KernelError) {
        self.state.borrow_mut().injected.push((no, err));
    }

    /// Every system call issued so far, oldest first.
    pub fn syscall_log(&self) -> Vec<SyscallRecord> {
        self.state.borrow().syscall_log.clone()
    }

    /// Every page fault raised so far, oldest first.
    pub fn fault_log(&self) -> Vec<FaultRecord> {
        self.state.borrow().fault_log.clone()
    }

    /// Read `len` bytes at `va` in `env` without permission checks or
    /// faults. Returns `None` if any page in the range is not mapped.
    pub fn peek(&self, env: EnvId, va: Va, len: usize) -> Option<Vec<u8>> {
        let st = self.state.borrow();
        let space = &st.envs.get(env)?.space;
        let mut out = Vec::with_capacity(len);
        let mut done = 0;
        while done < len {
            let at = va + done;
            let n = (PAGE_SIZE - at.offset()).min(len - done);
            let frame = st.frames.bytes(space.pte(at.pn()).pa()?)?;
            out.extend_from_slice(&frame[at.offset()..at.offset() + n]);
            done += n;
        }
        Some(out)
    }

    /// The entry mapping `va` in `env`.
    pub fn pte_of(&self, env: EnvId, va: Va) -> Pte {
        self.state
            .borrow()
            .envs
            .get(env)
            .map_or(Pte::EMPTY, |e| e.space.pte(va.pn()))
    }

    /// The frame mapped at `va` in `env`.
    pub fn frame_of(&self, env: EnvId, va: Va) -> Option<Pa> {
        self.pte_of(env, va).pa()
    }

    /// Every page mapped in `env`, in address order.
    pub fn mappings(&self, env: EnvId) -> Vec<(Va, Pte)> {
        self.state
            .borrow()
            .envs
            .get(env)
            .map(|e| e.space.mappings().collect())
            .unwrap_or_default()
    }

    /// Number of page table entries referencing `pa`.
    pub fn refcount(&self, pa: Pa) -> usize {
        self.state.borrow().frames.refcount(pa)
    }

    /// Number of frames currently held by environments.
    pub fn allocated_frames(&self) -> usize {
        self.state.borrow().frames.in_use()
    }

    /// Run state of `env`, or `None` if it does not exist.
    pub fn status(&self, env: EnvId) -> Option<EnvStatus> {
        self.state.borrow().envs.get(env).map(|e| e.status)
    }

    /// Raw address of the page fault upcall registered for `env`.
    pub fn upcall_of(&self, env: EnvId) -> Option<usize> {
        self.state.borrow().envs.get(env).and_then(|e| e.upcall)
    }

    /// The environment that created `env`.
    pub fn parent_of(&self, env: EnvId) -> Option<EnvId> {
        self.state.borrow().envs.get(env).map(|e| e.parent)
    }

    /// Every live environment.
    pub fn envs(&self) -> Vec<EnvId> {
        self.state.borrow().envs.iter().map(|e| e.id).collect()
    }
}

impl Kernel for SimKernel {
    fn syscall(&self, no: SyscallNumber, args: [usize; 5]) -> isize {
        match self.current.get() {
            Some(id) => self.syscall_raw(id, no.into(), args),
            None => KernelError::BadEnv.into_isize(),
        }
    }

    fn uvpd(&self, pdx: usize) -> Pde {
        let Some(id) = self.current.get() else {
            return Pde::EMPTY;
        };
        self.state
            .borrow()
            .envs
            .get(id)
            .map_or(Pde::EMPTY, |e| e.space.pde(pdx))
    }

    fn uvpt(&self, pn: usize) -> Pte {
        let Some(id) = self.current.get() else {
            return Pte::EMPTY;
        };
        self.state
            .borrow()
            .envs
            .get(id)
            .map_or(Pte::EMPTY, |e| e.space.pte(pn))
    }

    unsafe fn memmove(&self, dst: Va, src: Va, len: usize) {
        let moved = self
            .read(src, len)
            .and_then(|bytes| self.write(dst, &bytes));
        if let Err(e) = moved {
            log::debug!("memmove {} -> {}: {}", src, dst, e);
        }
    }
}
