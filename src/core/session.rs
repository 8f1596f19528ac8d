//! Session entry point
//!
//! The privileged controller clones the sandbox init into fresh namespaces,
//! drives its half of the handshake and maps ids when the init asked for a
//! user namespace. The init runs the bootstrap, forks the target and
//! supervises it as pid 1 of the new pid namespace.

use crate::config::types::{JailError, Result, SessionConfig, ABNORMAL_EXIT};
use crate::core::process_table::{
    BroadcastTarget, KernelReaper, KernelSignaller, ProcfsTable, ThreadSleeper,
};
use crate::core::supervisor::{Supervisor, SupervisorDeps};
use crate::exec::bootstrap::{run_bootstrap, Collaborators, KernelHost, Launch};
use crate::exec::handshake::{ChildEnds, ControllerEnds, HandshakeChannel};
use crate::exec::launch;
use crate::kernel::mount::MountFilesystem;
use crate::kernel::namespace;
use crate::kernel::net::KernelNetwork;
use crate::kernel::privilege::{EffectivePolicy, KernelBackend, PrivilegeEngine};
use crate::kernel::seccomp::HelperCompiler;
use crate::kernel::signal::{self, ShutdownSignal};
use crate::safety::run_files::RunFiles;
use nix::errno::Errno;
use nix::sched::clone;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, fork, getpid, ForkResult, Pid};

const INIT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Signals the controller turns into a SIGTERM for the sandbox init
const FORWARDED_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP];

/// Run one sandboxed session to completion.
///
/// Returns the exit status of the target, or `ABNORMAL_EXIT` when it was
/// killed or stopped abnormally.
pub fn run_sandboxed_session(config: SessionConfig) -> Result<i32> {
    config.validate()?;
    let policy = EffectivePolicy::from_config(&config);
    if policy.confined {
        log::info!("Confinement enforced: all capabilities dropped, default filter installed");
    }

    let (mut controller, child_ends) = HandshakeChannel::open()?.split();
    let controller_fds = controller.raw_fds();
    let flags = namespace::clone_flags(&config.network);
    let cfg = &config;

    let mut child_ends = Some(child_ends);
    let mut policy = Some(policy);
    let child_cb = Box::new(move || -> isize {
        for fd in &controller_fds {
            let _ = close(*fd);
        }
        match (child_ends.take(), policy.take()) {
            (Some(ends), Some(policy)) => sandbox_init(cfg, ends, policy) as isize,
            _ => 1,
        }
    });

    let mut stack = vec![0u8; INIT_STACK_SIZE];
    // SAFETY: the callback only uses state moved into it; the stack outlives
    // the call because the child runs on a copy of our address space.
    let child = unsafe { clone(child_cb, &mut stack, flags, Some(libc::SIGCHLD)) }
        .map_err(|e| JailError::Namespace(format!("clone(sandbox init): {}", e)))?;
    log::debug!("Sandbox init started as pid {}", child);

    signal::forward_to(child, &FORWARDED_SIGNALS)?;
    drive_controller(&mut controller, child, &config)
}

fn drive_controller(
    controller: &mut ControllerEnds,
    child: Pid,
    config: &SessionConfig,
) -> Result<i32> {
    if let Err(e) = controller.signal_namespaces_ready() {
        log::error!("{}", e);
        return wait_for_init(child);
    }

    if let Err(e) = controller.await_ready_for_mapping() {
        // The init closed its end, normally because the bootstrap failed.
        log::debug!("{}", e);
        return wait_for_init(child);
    }

    if namespace::in_separate_user_namespace(child)? {
        namespace::write_id_maps(child, config.user)?;
        log::debug!("User namespace id maps written for pid {}", child);
    }
    if let Err(e) = controller.signal_mapping_complete() {
        log::error!("{}", e);
    }

    wait_for_init(child)
}

fn wait_for_init(child: Pid) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            // The init reports an abnormal target as 255.
            Ok(WaitStatus::Exited(_, 255)) => return Ok(ABNORMAL_EXIT),
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                log::warn!("Sandbox init killed by {}", sig);
                return Ok(ABNORMAL_EXIT);
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(JailError::Process(format!("waitpid(sandbox init): {}", e))),
        }
    }
}

/// Body of the cloned sandbox init. Returns its exit status.
fn sandbox_init(config: &SessionConfig, handshake: ChildEnds, policy: EffectivePolicy) -> i32 {
    let mnt_dir = config.run_mnt_dir();
    let privileges = PrivilegeEngine::new(
        policy,
        config.user,
        Box::new(KernelBackend),
        RunFiles::new(&mnt_dir),
    );

    let mut host = KernelHost;
    let mut fs = MountFilesystem::new(&mnt_dir);
    let mut net = KernelNetwork::new();
    let mut compiler = HelperCompiler::new(&config.filter_helper, config.user);
    let deps = Collaborators {
        host: &mut host,
        fs: &mut fs,
        net: &mut net,
        compiler: &mut compiler,
    };

    match run_bootstrap(config, handshake, privileges, deps) {
        Ok(launch) => start_and_supervise(config, launch),
        Err(e) => {
            log::error!("Sandbox bootstrap failed: {}", e);
            e.exit_code()
        }
    }
}

fn start_and_supervise(config: &SessionConfig, launch: Launch) -> i32 {
    let Launch {
        plan,
        mut privileges,
        report,
    } = launch;
    for warning in &report.warnings {
        log::debug!("degraded: {}", warning);
    }

    let shutdown = match ShutdownSignal::install(&[Signal::SIGTERM]) {
        Ok(shutdown) => shutdown,
        Err(e) => {
            log::error!("{}", e);
            return e.exit_code();
        }
    };

    // SAFETY: the init is single-threaded; the child only execs or exits.
    let target = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            signal::reset_to_default(&[Signal::SIGTERM]);
            let err = launch::exec_program(&plan, &mut privileges);
            log::error!("Cannot start {}: {}", config.program.command_name(), err);
            std::process::exit(err.exit_code());
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            log::error!("fork(target): {}", e);
            return 1;
        }
    };
    log::info!("Child process initialized");

    let table = ProcfsTable::new();
    let mut reaper = KernelReaper;
    let mut signaller =
        KernelSignaller::new(BroadcastTarget::for_current_process(target.as_raw()));
    let mut sleeper = ThreadSleeper;
    let deps = SupervisorDeps {
        table: &table,
        reaper: &mut reaper,
        signaller: &mut signaller,
        sleeper: &mut sleeper,
        shutdown: &shutdown,
    };

    let own_pid = getpid().as_raw();
    match Supervisor::new(deps, config.program.command_name(), config.timeout, own_pid)
        .supervise(target)
    {
        Ok(end) => {
            log::debug!("Supervision ended: {:?}", end);
            end.exit_code()
        }
        Err(e) => {
            log::error!("{}", e);
            e.exit_code()
        }
    }
}
