use crate::config::types::{
    Credentials, DeviceClass, JailError, NetworkMode, PrivateHome, Result, SessionConfig,
    SoftWarning,
};
use crate::exec::handshake::ChildEnds;
use crate::exec::launch::{self, LaunchPlan};
use crate::kernel::credentials;
use crate::kernel::mount::{FilesystemEngine, FsAction};
use crate::kernel::namespace;
use crate::kernel::net::{self, NetworkEngine, NetworkReport};
use crate::kernel::privilege::{EffectivePolicy, PrivilegeEngine};
use crate::kernel::seccomp::FilterCompiler;
/// Sandbox init bootstrap
///
/// The fixed setup sequence run by the sandbox init between the clone and
/// the fork of the target:
///
/// Spawned -> NamespacesReady -> MountsIsolated -> NetworkReady ->
/// FiltersStaged -> FilesystemReady -> EnvironmentReady ->
/// PrivilegesReduced -> UserNamespaceReady -> IdsMapped -> ReadyToLaunch
///
/// Each step consumes the previous state and returns exactly one next state
/// on success. Only `Sandbox<ReadyToLaunch>` can produce a launch.
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Process-level operations of the sandbox init
pub trait SandboxHost {
    fn set_hostname(&mut self, name: &str) -> Result<()>;
    /// Stop mount events from reaching the host.
    fn make_mounts_slave(&mut self) -> Result<()>;
    fn set_parent_death_signal(&mut self) -> Result<()>;
    fn change_dir(&mut self, dir: &Path) -> Result<()>;
    fn set_nice(&mut self, increment: i32) -> Result<()>;
    fn drop_privileges(&mut self, user: Credentials, drop_groups: bool) -> Result<()>;
}

/// Host backed by the running process
#[derive(Debug, Default)]
pub struct KernelHost;

impl SandboxHost for KernelHost {
    fn set_hostname(&mut self, name: &str) -> Result<()> {
        namespace::set_hostname(name)
    }

    fn make_mounts_slave(&mut self) -> Result<()> {
        namespace::make_mounts_slave()
    }

    fn set_parent_death_signal(&mut self) -> Result<()> {
        launch::set_parent_death_signal()
    }

    fn change_dir(&mut self, dir: &Path) -> Result<()> {
        std::env::set_current_dir(dir).map_err(|e| {
            JailError::Filesystem(format!("cannot change directory to {}: {}", dir.display(), e))
        })
    }

    fn set_nice(&mut self, increment: i32) -> Result<()> {
        // nice(2) can legitimately return -1, so errno decides.
        nix::errno::Errno::clear();
        // SAFETY: plain nice(2) call.
        let rc = unsafe { libc::nice(increment) };
        let errno = nix::errno::Errno::last();
        if rc == -1 && errno != nix::errno::Errno::UnknownErrno {
            return Err(JailError::Process(format!("nice({}): {}", increment, errno)));
        }
        Ok(())
    }

    fn drop_privileges(&mut self, user: Credentials, drop_groups: bool) -> Result<()> {
        credentials::drop_privileges(user, drop_groups)
    }
}

/// External collaborators of the bootstrap
pub struct Collaborators<'a> {
    pub host: &'a mut dyn SandboxHost,
    pub fs: &'a mut dyn FilesystemEngine,
    pub net: &'a mut dyn NetworkEngine,
    pub compiler: &'a mut dyn FilterCompiler,
}

/// What the bootstrap did, including degraded guarantees
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub warnings: Vec<SoftWarning>,
    pub network: NetworkReport,
    pub confined: bool,
    pub postexec_seccomp: bool,
    pub user_namespace: bool,
    pub fs_actions: Vec<FsAction>,
}

impl BootstrapReport {
    fn warn(&mut self, warning: Option<SoftWarning>) {
        if let Some(warning) = warning {
            self.warnings.push(warning);
        }
    }
}

/// Tracer preload is needed for tracing or for custom seccomp lists.
pub fn needs_preload(config: &SessionConfig, policy: &EffectivePolicy) -> bool {
    config.trace.trace || config.trace.trace_log || policy.needs_postexec()
}

fn device_order() -> [DeviceClass; 4] {
    [
        DeviceClass::ThreeD,
        DeviceClass::Tv,
        DeviceClass::Dvd,
        DeviceClass::Video,
    ]
}

/// Filesystem actions of the private-mode, whitelist/blacklist, device
/// and DNS steps, in application order.
pub fn filesystem_plan(config: &SessionConfig, need_preload: bool) -> Vec<FsAction> {
    let fs = &config.filesystem;
    let mut plan = Vec::new();

    if fs.private_home != PrivateHome::Disabled {
        plan.push(FsAction::PrivateHome {
            mode: fs.private_home.clone(),
            home: config.home.clone(),
            owner: config.user,
        });
    }
    if fs.private_dev {
        plan.push(FsAction::PrivateDev);
    }
    if let Some(keep) = &fs.private_etc {
        plan.push(FsAction::PrivateDir {
            dir: PathBuf::from("/etc"),
            keep: keep.clone(),
        });
        // A fresh /etc lost the preload file.
        if need_preload {
            plan.push(FsAction::StagePreload(config.trace.preload_library.clone()));
        }
    }
    if let Some(keep) = &fs.private_opt {
        plan.push(FsAction::PrivateDir {
            dir: PathBuf::from("/opt"),
            keep: keep.clone(),
        });
    }
    if let Some(keep) = &fs.private_srv {
        plan.push(FsAction::PrivateDir {
            dir: PathBuf::from("/srv"),
            keep: keep.clone(),
        });
    }
    if fs.private_tmp {
        plan.push(FsAction::PrivateTmp);
    }
    if fs.disable_session_bus {
        plan.push(FsAction::DisableSessionBus { owner: config.user });
    }
    if let Some(hostname) = &config.hostname {
        plan.push(FsAction::HostnameFile(hostname.clone()));
    }
    if fs.hosts_file.is_some() {
        plan.push(FsAction::MountHostsFile);
    }
    if let NetworkMode::Namespace(name) = &config.network.mode {
        plan.push(FsAction::NetnsOverrides(name.clone()));
    }
    plan.push(FsAction::NormalizeSystemDirs);
    if fs.disable_mnt {
        plan.push(FsAction::DisableMnt);
    }

    if !fs.whitelist.is_empty() {
        plan.push(FsAction::Whitelist(fs.whitelist.clone()));
    }
    if !fs.blacklist.is_empty() {
        plan.push(FsAction::Blacklist(fs.blacklist.clone()));
    }

    if config.deny_devices.contains(&DeviceClass::Sound) {
        plan.push(FsAction::DisableAudioServer {
            home: config.home.clone(),
        });
        plan.push(FsAction::DisableDevices(DeviceClass::Sound));
    } else if !fs.no_audio_server {
        plan.push(FsAction::InitAudioServer {
            home: config.home.clone(),
            owner: config.user,
        });
    }
    for class in device_order() {
        if config.deny_devices.contains(&class) {
            plan.push(FsAction::DisableDevices(class));
        }
    }

    if need_preload {
        plan.push(FsAction::InstallTrace);
    }
    if !config.network.dns.is_empty() {
        plan.push(FsAction::ConfigureDns(config.network.dns.clone()));
    }
    plan
}

/// Type-state marker: cloned, waiting for the controller
pub struct Spawned;
/// Type-state marker: controller finished namespace setup
pub struct NamespacesReady;
/// Type-state marker: hostname set, mounts slave, work area mounted
pub struct MountsIsolated;
/// Type-state marker: packet filters and interfaces configured
pub struct NetworkReady;
/// Type-state marker: protocol filter compiled, preload and hosts staged
pub struct FiltersStaged;
/// Type-state marker: filesystem view complete, log flushed
pub struct FilesystemReady;
/// Type-state marker: working directory and nice value set
pub struct EnvironmentReady;
/// Type-state marker: capabilities, limits, affinity applied
pub struct PrivilegesReduced;
/// Type-state marker: user namespace attempted
pub struct UserNamespaceReady;
/// Type-state marker: controller wrote the id maps
pub struct IdsMapped;
/// Type-state marker: running as the invoking user, ready to fork
pub struct ReadyToLaunch;

/// Sandbox init with type-state tracking
pub struct Sandbox<'a, S> {
    config: &'a SessionConfig,
    handshake: ChildEnds,
    privileges: PrivilegeEngine,
    deps: Collaborators<'a>,
    report: BootstrapReport,
    need_preload: bool,
    _state: PhantomData<S>,
}

impl<'a, S> Sandbox<'a, S> {
    fn advance<N>(self) -> Sandbox<'a, N> {
        Sandbox {
            config: self.config,
            handshake: self.handshake,
            privileges: self.privileges,
            deps: self.deps,
            report: self.report,
            need_preload: self.need_preload,
            _state: PhantomData,
        }
    }
}

impl<'a> Sandbox<'a, Spawned> {
    /// The effective policy inside `privileges` is computed before the first
    /// step so every later step sees the confinement override.
    pub fn new(
        config: &'a SessionConfig,
        handshake: ChildEnds,
        privileges: PrivilegeEngine,
        deps: Collaborators<'a>,
    ) -> Self {
        let need_preload = needs_preload(config, privileges.policy());
        let report = BootstrapReport {
            confined: privileges.policy().confined,
            postexec_seccomp: privileges.policy().needs_postexec(),
            ..BootstrapReport::default()
        };
        Self {
            config,
            handshake,
            privileges,
            deps,
            report,
            need_preload,
            _state: PhantomData,
        }
    }

    pub fn await_namespaces(mut self) -> Result<Sandbox<'a, NamespacesReady>> {
        self.handshake.await_namespaces_ready()?;
        if nix::unistd::getpid().as_raw() == 1 {
            log::debug!("PID namespace installed");
        }
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, NamespacesReady> {
    /// Hostname, slave mount propagation, private work area.
    pub fn isolate_mounts(mut self) -> Result<Sandbox<'a, MountsIsolated>> {
        if let Some(hostname) = &self.config.hostname {
            self.deps.host.set_hostname(hostname)?;
        }
        self.deps.host.make_mounts_slave()?;

        let work_area = self.privileges.run_files().mnt_dir().to_path_buf();
        self.apply_fs(FsAction::MountWorkArea(work_area))?;
        Ok(self.advance())
    }
}

impl<'a, S> Sandbox<'a, S> {
    fn apply_fs(&mut self, action: FsAction) -> Result<()> {
        self.deps.fs.apply(&action)?;
        self.report.fs_actions.push(action);
        Ok(())
    }
}

impl<'a> Sandbox<'a, MountsIsolated> {
    pub fn configure_network(mut self) -> Result<Sandbox<'a, NetworkReady>> {
        let network = &self.config.network;
        net::build_netfilter(self.deps.net, network)?;
        let report = net::configure_network(self.deps.net, network)?;
        self.report.warnings.extend(report.warnings.iter().cloned());
        self.report.network = report;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, NetworkReady> {
    /// Compile the protocol filter as the invoking user, stage the tracer
    /// preload and keep a copy of the hosts file.
    pub fn stage_filters(mut self) -> Result<Sandbox<'a, FiltersStaged>> {
        if let Some(protocol) = &self.privileges.policy().protocol {
            log::debug!("Build protocol filter: {}", protocol);
        }
        self.privileges.stage_protocol_filter(self.deps.compiler)?;

        if self.need_preload {
            let library = self.config.trace.preload_library.clone();
            self.apply_fs(FsAction::StagePreload(library))?;
        }
        if let Some(hosts) = &self.config.filesystem.hosts_file {
            self.apply_fs(FsAction::StoreHostsFile(hosts.clone()))?;
        }
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, FiltersStaged> {
    pub fn build_filesystem(mut self) -> Result<Sandbox<'a, FilesystemReady>> {
        if self.report.confined {
            log::info!("Dropping all Linux capabilities and enforcing default seccomp filter");
        }

        for action in filesystem_plan(self.config, self.need_preload) {
            self.apply_fs(action)?;
        }

        let files = self.privileges.run_files().clone();
        self.deps.fs.flush_log(&files, self.config.user)?;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, FilesystemReady> {
    /// Parent-death signal, working directory, nice value, X11 cleanup.
    pub fn prepare_environment(mut self) -> Result<Sandbox<'a, EnvironmentReady>> {
        self.deps.host.set_parent_death_signal()?;

        let mut in_cwd = false;
        if let Some(cwd) = &self.config.cwd {
            match self.deps.host.change_dir(cwd) {
                Ok(()) => in_cwd = true,
                Err(e) => log::debug!("{}", e),
            }
        }
        if !in_cwd {
            self.deps.host.change_dir(Path::new("/"))?;
            if self.config.home.exists() {
                self.deps.host.change_dir(&self.config.home)?;
            }
        }

        if let Some(increment) = self.config.nice {
            if let Err(e) = self.deps.host.set_nice(increment) {
                let warning = SoftWarning::NiceFailed(e.to_string());
                log::warn!("{}", warning);
                self.report.warnings.push(warning);
            }
        }

        self.apply_fs(FsAction::CleanX11)?;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, EnvironmentReady> {
    /// Capabilities, resource limits, affinity and cgroup record, then the
    /// general and memory filters are compiled while still privileged.
    pub fn reduce_privileges(mut self) -> Result<Sandbox<'a, PrivilegesReduced>> {
        self.privileges.apply_capabilities()?;
        self.privileges.apply_rlimits(&self.config.limits)?;
        self.privileges.apply_affinity(&self.config.cpus)?;
        if let Some(cgroup) = &self.config.cgroup {
            self.privileges.record_cgroup(cgroup)?;
        }
        self.privileges.stage_filters(self.deps.compiler)?;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, PrivilegesReduced> {
    pub fn enter_user_namespace(mut self) -> Result<Sandbox<'a, UserNamespaceReady>> {
        self.privileges.persist_groups_marker()?;
        if self.config.noroot {
            let warning = self.privileges.create_user_namespace();
            self.report.warn(warning);
        }
        self.report.user_namespace = self.privileges.state().user_namespace;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, UserNamespaceReady> {
    /// Second round trip: the controller writes the id maps in between.
    pub fn complete_handshake(mut self) -> Result<Sandbox<'a, IdsMapped>> {
        self.handshake.signal_ready_for_mapping()?;
        self.handshake.await_mapping_complete()?;
        self.privileges.reapply_after_user_namespace()?;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, IdsMapped> {
    /// No-new-privileges if requested, then switch to the invoking user.
    pub fn lock_privileges(mut self) -> Result<Sandbox<'a, ReadyToLaunch>> {
        if self.config.no_new_privs {
            let warning = self.privileges.lock_no_new_privs();
            self.report.warn(warning);
        }
        let drop_groups = self.privileges.policy().drop_groups;
        self.deps
            .host
            .drop_privileges(self.config.user, drop_groups)?;
        Ok(self.advance())
    }
}

/// Handed to the fork: the target execs `plan`, the init supervises.
pub struct Launch {
    pub plan: LaunchPlan,
    pub privileges: PrivilegeEngine,
    pub report: BootstrapReport,
}

impl<'a> Sandbox<'a, ReadyToLaunch> {
    /// This is the ONLY way to obtain a launch.
    pub fn into_launch(self) -> Launch {
        let mut plan = LaunchPlan::new(self.config.program.clone());
        plan.env.extend(self.config.env.iter().cloned());
        plan.apparmor = self.config.apparmor;
        if self.config.filesystem.disable_session_bus {
            plan.unset.push("DBUS_SESSION_BUS_ADDRESS".to_string());
        }
        Launch {
            plan,
            privileges: self.privileges,
            report: self.report,
        }
    }
}

/// Run every bootstrap step in order.
pub fn run_bootstrap<'a>(
    config: &'a SessionConfig,
    handshake: ChildEnds,
    privileges: PrivilegeEngine,
    deps: Collaborators<'a>,
) -> Result<Launch> {
    let launch = Sandbox::new(config, handshake, privileges, deps)
        .await_namespaces()?
        .isolate_mounts()?
        .configure_network()?
        .stage_filters()?
        .build_filesystem()?
        .prepare_environment()?
        .reduce_privileges()?
        .enter_user_namespace()?
        .complete_handshake()?
        .lock_privileges()?
        .into_launch();
    Ok(launch)
}
