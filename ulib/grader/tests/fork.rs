use abyss::{
    EnvId, EnvStatus, KernelError, PAGE_SIZE, PteFlags, SyscallNumber, Va,
    memlayout::{PFTEMP, USTACKTOP, uxstack_page},
};
use ulib::{
    Env, ForkConfig, ForkError, ForkOutcome, Violation, fork,
    fork::duppage,
    page_table::{PTE_COW, PageState},
    pgfault::{pgfault_upcall, set_pgfault_handler},
};
use ulib_grader::SimKernel;

const RW: PteFlags = PteFlags::from_bits_truncate(0b111);
const RO: PteFlags = PteFlags::from_bits_truncate(0b101);

fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

/// Boot a kernel with one running environment.
fn boot(kernel: &SimKernel) -> EnvId {
    let _ = env_logger::builder().is_test(true).try_init();
    let root = kernel.create_env().unwrap();
    kernel.run(root).unwrap();
    root
}

fn fork_parent(env: &mut Env<'_>) -> EnvId {
    match fork(env) {
        Ok(ForkOutcome::Parent { child }) => child,
        other => panic!("fork() in the parent returned {:?}", other),
    }
}

/// A writable page ends up copy-on-write in both environments, backed by one
/// frame.
///
/// It ensures that:
/// - Both entries carry `P|U|COW` and not `W`.
/// - The frame's reference count is two.
/// - The child is runnable and has its own exception stack and upcall.
#[test]
fn writable_page_becomes_cow() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    kernel.load_page(root, va(0x0080_0000), RW, &[0x11; 16]).unwrap();

    let mut env = Env::new(&kernel).unwrap();
    let child = fork_parent(&mut env);

    let expected = PteFlags::P | PteFlags::U | PTE_COW;
    assert_eq!(kernel.pte_of(root, va(0x0080_0000)).flags(), expected);
    assert_eq!(kernel.pte_of(child, va(0x0080_0000)).flags(), expected);
    let pa = kernel.frame_of(root, va(0x0080_0000)).unwrap();
    assert_eq!(kernel.frame_of(child, va(0x0080_0000)), Some(pa));
    assert_eq!(kernel.refcount(pa), 2);

    assert_eq!(kernel.status(child), Some(EnvStatus::Runnable));
    assert_eq!(kernel.parent_of(child), Some(root));
    assert_eq!(
        kernel.upcall_of(child),
        Some(pgfault_upcall as ulib::Upcall as usize)
    );
    assert_ne!(
        kernel.frame_of(root, uxstack_page()),
        kernel.frame_of(child, uxstack_page()),
        "exception stack must never be shared"
    );
    assert_eq!(kernel.pte_of(child, uxstack_page()).flags(), RW);
    assert_eq!(kernel.pte_of(root, uxstack_page()).flags(), RW);
}

/// Read-only pages are shared as they are and never copied or re-marked.
#[test]
fn read_only_page_is_shared() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    kernel.load_page(root, va(0x0080_0000), RO, b"text").unwrap();

    let mut env = Env::new(&kernel).unwrap();
    let child = fork_parent(&mut env);

    assert_eq!(kernel.pte_of(root, va(0x0080_0000)).flags(), RO);
    assert_eq!(kernel.pte_of(child, va(0x0080_0000)).flags(), RO);
    let pa = kernel.frame_of(root, va(0x0080_0000)).unwrap();
    assert_eq!(kernel.frame_of(child, va(0x0080_0000)), Some(pa));

    let remaps = kernel
        .syscall_log()
        .iter()
        .filter(|r| r.is(SyscallNumber::PageMap))
        .filter(|r| r.args[2] == 0 || r.args[2] == root.into_usize())
        .count();
    assert_eq!(remaps, 0, "read-only pages must not be re-marked in the parent");
}

/// Software bits other than COW survive into the child of a read-only page.
#[test]
fn read_only_page_keeps_available_bits() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    let perm = RO | PteFlags::AVAIL_0;
    kernel.load_page(root, va(0x0080_0000), perm, b"x").unwrap();

    let mut env = Env::new(&kernel).unwrap();
    let child = fork_parent(&mut env);
    assert_eq!(kernel.pte_of(child, va(0x0080_0000)).flags(), perm);
}

/// Pages already COW-shared are re-shared with the new child and stay COW in
/// the parent.
#[test]
fn cow_page_is_reshared() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    kernel.load_page(root, va(0x0080_0000), RW, &[7]).unwrap();

    let mut env = Env::new(&kernel).unwrap();
    let first = fork_parent(&mut env);
    let second = fork_parent(&mut env);

    let pa = kernel.frame_of(root, va(0x0080_0000)).unwrap();
    assert_eq!(kernel.frame_of(first, va(0x0080_0000)), Some(pa));
    assert_eq!(kernel.frame_of(second, va(0x0080_0000)), Some(pa));
    assert_eq!(kernel.refcount(pa), 3);
    assert_eq!(
        PageState::classify(kernel.pte_of(second, va(0x0080_0000))),
        PageState::CowShared
    );
}

/// A COW page that is still writable in the parent loses `W` at fork.
///
/// It ensures that:
/// - The parent's entry is re-mapped onto itself, ending up exactly
///   `P|U|COW`.
/// - A later write by the parent faults and leaves the child's byte alone.
#[test]
fn writable_cow_page_is_remarked() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    let page = va(0x0080_0000);
    kernel.load_page(root, page, RW | PTE_COW, &[0x00]).unwrap();

    let mut env = Env::new(&kernel).unwrap();
    let child = fork_parent(&mut env);

    let expected = PteFlags::P | PteFlags::U | PTE_COW;
    assert_eq!(kernel.pte_of(root, page).flags(), expected);
    assert_eq!(kernel.pte_of(child, page).flags(), expected);
    let remarks = kernel
        .syscall_log()
        .iter()
        .filter(|r| r.is(SyscallNumber::PageMap) && !r.failed())
        .filter(|r| r.args[2] == 0 && r.args[3] == page.into_usize())
        .count();
    assert_eq!(remarks, 1, "the parent must be re-marked exactly once");

    kernel.write(page, &[0xff]).unwrap();
    assert_eq!(kernel.fault_log().len(), 1);
    assert_eq!(
        kernel.peek(child, page, 1).unwrap(),
        [0x00],
        "parent write leaked into child"
    );
    assert_eq!(kernel.peek(root, page, 1).unwrap(), [0xff]);
}

/// `duppage` refuses a user page at the fault handler's scratch address.
///
/// It ensures that:
/// - `fork` fails with [`Violation::ScratchPageInUse`].
/// - The child never receives the page.
/// - The parent's page keeps its permissions and contents.
#[test]
fn scratch_page_is_never_duplicated() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    kernel.load_page(root, PFTEMP, RW, &[7]).unwrap();
    let mut env = Env::new(&kernel).unwrap();

    let result = fork(&mut env);
    assert_eq!(
        result,
        Err(ForkError::InvariantViolation(Violation::ScratchPageInUse {
            va: PFTEMP
        }))
    );
    assert!(result.unwrap_err().is_fatal());

    let child = kernel.envs().into_iter().find(|e| *e != root).unwrap();
    assert!(kernel.frame_of(child, PFTEMP).is_none());
    assert_eq!(kernel.status(child), Some(EnvStatus::NotRunnable));
    assert_eq!(kernel.pte_of(root, PFTEMP).flags(), RW);
    assert_eq!(kernel.peek(root, PFTEMP, 1).unwrap(), [7]);
}

/// Kernel-only pages and unmapped pages are never passed on.
#[test]
fn kernel_only_and_absent_pages_are_skipped() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    kernel
        .load_page(root, va(0x0080_0000), PteFlags::P | PteFlags::W, b"k")
        .unwrap();

    let mut env = Env::new(&kernel).unwrap();
    let child = fork_parent(&mut env);
    assert!(kernel.frame_of(child, va(0x0080_0000)).is_none());
    assert!(kernel.frame_of(child, va(0x0080_1000)).is_none());
    assert_eq!(
        kernel.pte_of(root, va(0x0080_0000)).flags(),
        PteFlags::P | PteFlags::W
    );
}

/// The child resumes with a copy of the parent's context; `fork` must give
/// it its own identity.
#[test]
fn child_identity_is_fixed_up() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    kernel.load_page(root, va(0x0080_0000), RW, &[1]).unwrap();

    let mut env = Env::new(&kernel).unwrap();
    let mut child_env = env.clone();
    let child = fork_parent(&mut env);
    assert_eq!(env.id(), root);
    assert_eq!(child_env.id(), root, "the child starts with a stale identity");

    kernel.run(child).unwrap();
    assert_eq!(fork(&mut child_env), Ok(ForkOutcome::Child));
    assert_eq!(child_env.id(), child);
    assert_eq!(kernel.status(child), Some(EnvStatus::Running));
    assert_eq!(kernel.status(root), Some(EnvStatus::Runnable));
}

/// A child may fork again; the grandchild shares the same frame.
#[test]
fn nested_fork() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    kernel.load_page(root, va(0x0080_0000), RW, b"root").unwrap();

    let mut env = Env::new(&kernel).unwrap();
    let mut child_env = env.clone();
    let child = fork_parent(&mut env);

    kernel.run(child).unwrap();
    assert_eq!(fork(&mut child_env), Ok(ForkOutcome::Child));
    let mut grandchild_env = child_env.clone();
    let grandchild = fork_parent(&mut child_env);
    assert_eq!(kernel.parent_of(grandchild), Some(child));

    let pa = kernel.frame_of(root, va(0x0080_0000)).unwrap();
    assert_eq!(kernel.frame_of(grandchild, va(0x0080_0000)), Some(pa));
    assert_eq!(kernel.refcount(pa), 3);

    kernel.run(grandchild).unwrap();
    assert_eq!(fork(&mut grandchild_env), Ok(ForkOutcome::Child));
    assert_eq!(grandchild_env.id(), grandchild);
    kernel.write(va(0x0080_0000), b"gc").unwrap();
    assert_eq!(kernel.peek(root, va(0x0080_0000), 4).unwrap(), b"root");
    assert_eq!(kernel.peek(child, va(0x0080_0000), 4).unwrap(), b"root");
    assert_eq!(kernel.peek(grandchild, va(0x0080_0000), 4).unwrap(), b"gcot");
    assert_eq!(kernel.refcount(pa), 2);
}

/// Installing the handler twice allocates the exception stack once and
/// registers the same upcall.
#[test]
fn handler_installation_is_idempotent() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    let env = Env::new(&kernel).unwrap();

    set_pgfault_handler(&env).unwrap();
    let stack = kernel.frame_of(root, uxstack_page()).unwrap();
    let upcall = kernel.upcall_of(root);
    let frames = kernel.allocated_frames();

    set_pgfault_handler(&env).unwrap();
    assert_eq!(kernel.frame_of(root, uxstack_page()), Some(stack));
    assert_eq!(kernel.upcall_of(root), upcall);
    assert_eq!(kernel.allocated_frames(), frames);

    let allocs = kernel
        .syscall_log()
        .iter()
        .filter(|r| r.is(SyscallNumber::PageAlloc))
        .count();
    let registrations = kernel
        .syscall_log()
        .iter()
        .filter(|r| r.is(SyscallNumber::EnvSetPgfaultUpcall))
        .count();
    assert_eq!(allocs, 1);
    assert_eq!(registrations, 2);
}

/// `duppage` refuses the exception stack page whatever it holds.
#[test]
fn exception_stack_is_never_duplicated() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    let env = Env::new(&kernel).unwrap();
    set_pgfault_handler(&env).unwrap();

    let child = ulib::syscall::sys_exofork(&kernel).unwrap();
    let before = kernel.syscall_log().len();
    assert_eq!(
        duppage(&env, child, uxstack_page().pn()),
        Err(ForkError::InvariantViolation(Violation::ExceptionStackShared))
    );
    assert_eq!(kernel.syscall_log().len(), before, "no system call may be issued");
    assert!(kernel.frame_of(child, uxstack_page()).is_none());
    assert_eq!(kernel.pte_of(root, uxstack_page()).flags(), RW);
}

/// A failing `exofork` is reported as recoverable and nothing else happens.
#[test]
fn exofork_failure_stops_fork() {
    let kernel = SimKernel::builder().max_envs(1).build();
    let root = boot(&kernel);
    kernel.load_page(root, va(0x0080_0000), RW, &[1]).unwrap();
    let mut env = Env::new(&kernel).unwrap();

    let result = fork(&mut env);
    assert_eq!(result, Err(ForkError::ChildCreationFailed(KernelError::NoFreeEnv)));
    assert!(!result.unwrap_err().is_fatal());

    let log = kernel.syscall_log();
    let exofork = log
        .iter()
        .position(|r| r.is(SyscallNumber::Exofork))
        .unwrap();
    assert_eq!(exofork, log.len() - 1, "no system call may follow a failed exofork");
    assert_eq!(kernel.pte_of(root, va(0x0080_0000)).flags(), RW);
}

/// A failing mapping in the middle of the walk aborts the fork, and the
/// child is never made runnable.
#[test]
fn page_map_failure_is_fatal() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    for i in 0..4 {
        kernel
            .load_page(root, va(0x0080_0000 + i * PAGE_SIZE), RW, &[i as u8])
            .unwrap();
    }
    let mut env = Env::new(&kernel).unwrap();
    kernel.fail_next(SyscallNumber::PageMap, KernelError::NoMemory);

    let result = fork(&mut env);
    assert_eq!(
        result,
        Err(ForkError::ResourceExhausted {
            syscall: SyscallNumber::PageMap,
            error: KernelError::NoMemory,
        })
    );
    assert!(result.unwrap_err().is_fatal());

    let log = kernel.syscall_log();
    let last = log.last().unwrap();
    assert!(last.is(SyscallNumber::PageMap) && last.failed());
    assert!(!log.iter().any(|r| r.is(SyscallNumber::EnvSetStatus)));
    let child = kernel.envs().into_iter().find(|e| *e != root).unwrap();
    assert_eq!(kernel.status(child), Some(EnvStatus::NotRunnable));
}

/// Running out of frames while giving the child its exception stack aborts
/// the fork before the child is marked runnable.
#[test]
fn out_of_frames_for_child_stack() {
    // One data page and the parent's exception stack.
    let kernel = SimKernel::builder().max_frames(2).build();
    let root = boot(&kernel);
    kernel.load_page(root, va(0x0080_0000), RW, &[1]).unwrap();
    let mut env = Env::new(&kernel).unwrap();

    assert_eq!(
        fork(&mut env),
        Err(ForkError::ResourceExhausted {
            syscall: SyscallNumber::PageAlloc,
            error: KernelError::NoMemory,
        })
    );
    let child = kernel.envs().into_iter().find(|e| *e != root).unwrap();
    assert_eq!(kernel.status(child), Some(EnvStatus::NotRunnable));
    assert!(kernel.frame_of(child, va(0x0080_0000)).is_some());
    assert!(kernel.upcall_of(child).is_none());
}

/// The walk stops at the configured high-water mark.
#[test]
fn high_water_mark_bounds_the_walk() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    kernel.load_page(root, va(0x0080_0000), RW, &[1]).unwrap();
    kernel.load_page(root, va(0x0100_0000), RW, &[2]).unwrap();
    kernel.load_page(root, USTACKTOP - PAGE_SIZE, RW, &[3]).unwrap();

    let config = ForkConfig::default()
        .with_high_water_mark(va(0x0080_1000))
        .unwrap();
    let mut env = Env::new(&kernel).unwrap().with_config(config);
    let child = fork_parent(&mut env);

    assert!(kernel.frame_of(child, va(0x0080_0000)).is_some());
    assert!(kernel.frame_of(child, va(0x0100_0000)).is_none());
    assert!(kernel.frame_of(child, USTACKTOP - PAGE_SIZE).is_none());
    assert_eq!(kernel.pte_of(root, va(0x0100_0000)).flags(), RW);

    // With the default mark the user stack is included.
    let mut env = Env::new(&kernel).unwrap();
    let child = fork_parent(&mut env);
    assert!(kernel.frame_of(child, USTACKTOP - PAGE_SIZE).is_some());
}

/// Frames are returned once every environment mapping them is gone.
#[test]
fn frames_are_reclaimed() {
    let kernel = SimKernel::default();
    let root = boot(&kernel);
    kernel.load_page(root, va(0x0080_0000), RW, &[1]).unwrap();
    kernel.load_page(root, va(0x0080_1000), RO, &[2]).unwrap();

    let mut env = Env::new(&kernel).unwrap();
    let child = fork_parent(&mut env);
    // Two data pages and two exception stacks.
    assert_eq!(kernel.allocated_frames(), 4);

    kernel.write(va(0x0080_0000), &[9]).unwrap();
    assert_eq!(kernel.allocated_frames(), 5);

    ulib::syscall::sys_env_destroy(&kernel, child).unwrap();
    assert_eq!(kernel.status(child), None);
    assert_eq!(kernel.allocated_frames(), 3);

    env.exit().unwrap();
    assert_eq!(kernel.status(root), None);
    assert_eq!(kernel.allocated_frames(), 0);
}
