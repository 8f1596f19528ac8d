//! Privilege reduction engine.
//!
//! Applies capability, resource-limit, affinity, user-namespace and seccomp
//! policy in a fixed order and keeps track of what is in force. The state
//! only ever shrinks, except that the capability policy is applied again
//! after a user namespace was created.

use crate::config::types::{
    CapabilityPolicy, Credentials, ResourceLimits, Result, SessionConfig, SoftWarning,
};
use crate::kernel::capabilities::{self, CapSet, Capability};
use crate::kernel::rlimits::{self, ResourceLimit};
use crate::kernel::seccomp::{self, FilterCompiler, FilterStage, GeneralFilter, GeneralFilterClass};
use crate::kernel::{affinity, namespace};
use crate::safety::run_files::{RunFile, RunFiles};
use std::path::{Path, PathBuf};

/// Kernel operations the engine needs
pub trait PrivilegeBackend {
    fn bounding_set(&self) -> Result<CapSet>;
    fn effective_set(&self) -> Result<CapSet>;
    fn drop_bounding(&mut self, cap: Capability) -> Result<()>;
    fn set_rlimit(&mut self, limit: ResourceLimit, value: u64) -> Result<()>;
    fn affinity(&self) -> Result<Vec<usize>>;
    fn set_affinity(&mut self, cpus: &[usize]) -> Result<()>;
    fn unshare_user_namespace(&mut self) -> Result<()>;
    fn set_no_new_privs(&mut self) -> Result<()>;
    fn load_filter(&mut self, path: &Path) -> Result<()>;
}

/// Backend acting on the calling process
pub struct KernelBackend;

impl PrivilegeBackend for KernelBackend {
    fn bounding_set(&self) -> Result<CapSet> {
        capabilities::read_bounding_set()
    }

    fn effective_set(&self) -> Result<CapSet> {
        capabilities::read_effective_set()
    }

    fn drop_bounding(&mut self, cap: Capability) -> Result<()> {
        capabilities::drop_bounding_capability(cap)
    }

    fn set_rlimit(&mut self, limit: ResourceLimit, value: u64) -> Result<()> {
        rlimits::apply_limit(limit, value)
    }

    fn affinity(&self) -> Result<Vec<usize>> {
        affinity::current_cpus()
    }

    fn set_affinity(&mut self, cpus: &[usize]) -> Result<()> {
        affinity::set_cpus(cpus)
    }

    fn unshare_user_namespace(&mut self) -> Result<()> {
        namespace::unshare_user_namespace()
    }

    fn set_no_new_privs(&mut self) -> Result<()> {
        capabilities::set_no_new_privs()
    }

    fn load_filter(&mut self, path: &Path) -> Result<()> {
        seccomp::load_filter_file(path)
    }
}

/// Policy after the confinement override, computed once from the config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub capabilities: CapabilityPolicy,
    pub general_filter: Option<GeneralFilter>,
    pub protocol: Option<String>,
    pub memory_deny_write_execute: bool,
    pub drop_groups: bool,
    pub confined: bool,
}

impl EffectivePolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        let policy = Self {
            capabilities: config.capabilities.clone(),
            general_filter: GeneralFilter::from_policy(&config.seccomp),
            protocol: config.seccomp.protocol.clone(),
            memory_deny_write_execute: config.seccomp.memory_deny_write_execute,
            drop_groups: config.drop_groups,
            confined: false,
        };
        if config.enforce_confinement {
            policy.enforce_confinement(&config.seccomp.extra)
        } else {
            policy
        }
    }

    /// Hard override: default filter, all capabilities dropped, no
    /// supplementary groups. Keep and drop lists are discarded, never merged;
    /// `extra` additions to the default filter survive.
    pub fn enforce_confinement(mut self, extra: &[String]) -> Self {
        if !matches!(
            self.capabilities,
            CapabilityPolicy::None | CapabilityPolicy::DropAll
        ) {
            log::warn!("Capability list ignored, all capabilities are dropped in confined mode");
        }
        if matches!(
            self.general_filter,
            Some(GeneralFilter::Drop(_)) | Some(GeneralFilter::Keep(_))
        ) {
            log::warn!("Seccomp lists ignored, the default filter is enforced in confined mode");
        }

        self.capabilities = CapabilityPolicy::DropAll;
        self.general_filter = Some(GeneralFilter::Default {
            extra: extra.to_vec(),
        });
        self.drop_groups = true;
        self.confined = true;
        self
    }

    /// Whether the preload shim has to enforce seccomp lists after exec.
    pub fn needs_postexec(&self) -> bool {
        self.general_filter
            .as_ref()
            .map(GeneralFilter::needs_postexec)
            .unwrap_or(false)
    }
}

/// What is currently in force
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivilegeState {
    /// Bounding set after the last application; `None` until applied
    pub capabilities: Option<CapSet>,
    pub general_filter: Option<GeneralFilterClass>,
    pub protocol_filter: bool,
    pub mdwx_filter: bool,
    pub rlimits: Vec<(ResourceLimit, u64)>,
    pub affinity: Option<Vec<usize>>,
    pub no_new_privs: bool,
    pub user_namespace: bool,
    pub drop_groups: bool,
    /// Compiled filter files, in load order
    pub staged_filters: Vec<(FilterStage, PathBuf)>,
    pub loaded_filters: Vec<FilterStage>,
}

fn load_rank(stage: &FilterStage) -> u8 {
    match stage {
        FilterStage::Protocol => 0,
        FilterStage::General(_) => 1,
        FilterStage::MemoryDenyWriteExecute => 2,
    }
}

pub struct PrivilegeEngine {
    policy: EffectivePolicy,
    user: Credentials,
    state: PrivilegeState,
    backend: Box<dyn PrivilegeBackend>,
    files: RunFiles,
}

impl PrivilegeEngine {
    pub fn new(
        policy: EffectivePolicy,
        user: Credentials,
        backend: Box<dyn PrivilegeBackend>,
        files: RunFiles,
    ) -> Self {
        Self {
            policy,
            user,
            state: PrivilegeState::default(),
            backend,
            files,
        }
    }

    pub fn policy(&self) -> &EffectivePolicy {
        &self.policy
    }

    pub fn state(&self) -> &PrivilegeState {
        &self.state
    }

    pub fn run_files(&self) -> &RunFiles {
        &self.files
    }

    fn shrink_bounding_set(&mut self) -> Result<CapSet> {
        let current = self.backend.bounding_set()?;
        let target = capabilities::resolve(&self.policy.capabilities, current)?;
        for cap in current.difference(target).iter() {
            self.backend.drop_bounding(cap)?;
        }
        log::debug!(
            "Capability bounding set {} -> {}",
            current.to_hex(),
            target.to_hex()
        );
        self.state.capabilities = Some(target);
        Ok(target)
    }

    /// Shrink the bounding set to the policy's target and persist the mask.
    pub fn apply_capabilities(&mut self) -> Result<CapSet> {
        let target = self.shrink_bounding_set()?;
        self.files.write(RunFile::Caps, &target.to_hex())?;
        Ok(target)
    }

    pub fn apply_rlimits(&mut self, limits: &ResourceLimits) -> Result<()> {
        for (limit, value) in rlimits::requested(limits) {
            self.backend.set_rlimit(limit, value)?;
            self.state.rlimits.push((limit, value));
        }
        Ok(())
    }

    /// The previous mask is persisted before it is replaced.
    pub fn apply_affinity(&mut self, cpus: &[usize]) -> Result<()> {
        if cpus.is_empty() {
            return Ok(());
        }
        let previous = self.backend.affinity()?;
        self.files
            .write(RunFile::Cpu, &affinity::format_cpu_list(&previous))?;
        self.backend.set_affinity(cpus)?;
        self.state.affinity = Some(cpus.to_vec());
        Ok(())
    }

    pub fn record_cgroup(&mut self, path: &Path) -> Result<()> {
        self.files
            .write(RunFile::Cgroup, &format!("{}\n", path.display()))?;
        log::debug!("Recorded cgroup {}", path.display());
        Ok(())
    }

    pub fn persist_groups_marker(&mut self) -> Result<()> {
        self.state.drop_groups = self.policy.drop_groups;
        if self.policy.drop_groups {
            self.files.write(RunFile::Groups, "")?;
        }
        Ok(())
    }

    /// Best effort: a refusal clears the user-namespace flag.
    pub fn create_user_namespace(&mut self) -> Option<SoftWarning> {
        match self.backend.unshare_user_namespace() {
            Ok(()) => {
                self.state.user_namespace = true;
                log::debug!("Created user namespace");
                None
            }
            Err(e) => {
                self.state.user_namespace = false;
                let warning = SoftWarning::UserNamespaceDenied(e.to_string());
                log::warn!("{}", warning);
                Some(warning)
            }
        }
    }

    /// Creating a user namespace resets the capability sets. The persisted
    /// mask is left as written.
    pub fn reapply_after_user_namespace(&mut self) -> Result<()> {
        if self.state.user_namespace {
            log::debug!("noroot user namespace installed");
            self.shrink_bounding_set()?;
        }
        Ok(())
    }

    pub fn lock_no_new_privs(&mut self) -> Option<SoftWarning> {
        match self.backend.set_no_new_privs() {
            Ok(()) => {
                self.state.no_new_privs = true;
                None
            }
            Err(e) => {
                let warning = SoftWarning::NoNewPrivsUnsupported(e.to_string());
                log::warn!("{}", warning);
                Some(warning)
            }
        }
    }

    fn compile_stage(
        &mut self,
        stage: FilterStage,
        compile: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<()> {
        let path = self.files.artifact(stage.file_name());
        self.files
            .prepare_for_user(&path, self.user.uid, self.user.gid)?;
        compile(&path)?;
        self.files.seal(&path)?;
        self.state.staged_filters.push((stage, path));
        self.state
            .staged_filters
            .sort_by_key(|(stage, _)| load_rank(stage));
        Ok(())
    }

    /// Compile the protocol filter and persist its spec.
    pub fn stage_protocol_filter(&mut self, compiler: &mut dyn FilterCompiler) -> Result<()> {
        let Some(spec) = self.policy.protocol.clone() else {
            return Ok(());
        };
        self.files.write(RunFile::Protocol, &format!("{}\n", spec))?;
        self.compile_stage(FilterStage::Protocol, |out| {
            compiler.compile_protocol(&spec, out)
        })?;
        self.state.protocol_filter = true;
        Ok(())
    }

    /// Compile the general and memory-deny-write-execute filters, then
    /// record the full list of filter files.
    pub fn stage_filters(&mut self, compiler: &mut dyn FilterCompiler) -> Result<()> {
        if let Some(filter) = self.policy.general_filter.clone() {
            self.compile_stage(FilterStage::General(filter.class()), |out| {
                compiler.compile_general(&filter, out)
            })?;
            self.state.general_filter = Some(filter.class());
        }
        if self.policy.memory_deny_write_execute {
            self.compile_stage(FilterStage::MemoryDenyWriteExecute, |out| {
                compiler.compile_memory_deny_write_execute(out)
            })?;
            self.state.mdwx_filter = true;
        }

        if !self.state.staged_filters.is_empty() {
            let listing: String = self
                .state
                .staged_filters
                .iter()
                .map(|(_, path)| format!("{}\n", path.display()))
                .collect();
            self.files.write(RunFile::Seccomp, &listing)?;
        }
        Ok(())
    }

    /// Install the staged filters in load order. Runs in the target process
    /// right before exec.
    pub fn load_filters(&mut self) -> Result<()> {
        if self.state.staged_filters.is_empty() {
            return Ok(());
        }
        // Without CAP_SYS_ADMIN the kernel refuses filters unless no-new-privs is set.
        if !self.state.no_new_privs
            && !self.backend.effective_set()?.contains(Capability::SYS_ADMIN)
        {
            self.backend.set_no_new_privs()?;
            self.state.no_new_privs = true;
        }
        let staged = self.state.staged_filters.clone();
        for (stage, path) in staged {
            self.backend.load_filter(&path)?;
            self.state.loaded_filters.push(stage);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::types::JailError;
    use std::sync::{Arc, Mutex};

    /// Observable kernel double
    #[derive(Debug, Default)]
    pub struct FakeKernel {
        pub bounding: CapSet,
        pub effective: CapSet,
        pub dropped: Vec<Capability>,
        pub rlimits: Vec<(ResourceLimit, u64)>,
        pub cpus: Vec<usize>,
        pub user_namespace: bool,
        pub deny_user_namespace: bool,
        pub no_new_privs: bool,
        pub loaded: Vec<PathBuf>,
    }

    #[derive(Clone)]
    pub struct FakeBackend(pub Arc<Mutex<FakeKernel>>);

    impl FakeBackend {
        pub fn new() -> Self {
            FakeBackend(Arc::new(Mutex::new(FakeKernel {
                bounding: CapSet::full(),
                cpus: vec![0, 1, 2, 3],
                ..FakeKernel::default()
            })))
        }

        /// What a fresh user namespace does to the bounding set.
        pub fn reset_bounding(&self) {
            self.0.lock().unwrap().bounding = CapSet::full();
        }
    }

    impl PrivilegeBackend for FakeBackend {
        fn bounding_set(&self) -> Result<CapSet> {
            Ok(self.0.lock().unwrap().bounding)
        }

        fn effective_set(&self) -> Result<CapSet> {
            Ok(self.0.lock().unwrap().effective)
        }

        fn drop_bounding(&mut self, cap: Capability) -> Result<()> {
            let mut k = self.0.lock().unwrap();
            k.bounding.remove(cap);
            k.dropped.push(cap);
            Ok(())
        }

        fn set_rlimit(&mut self, limit: ResourceLimit, value: u64) -> Result<()> {
            self.0.lock().unwrap().rlimits.push((limit, value));
            Ok(())
        }

        fn affinity(&self) -> Result<Vec<usize>> {
            Ok(self.0.lock().unwrap().cpus.clone())
        }

        fn set_affinity(&mut self, cpus: &[usize]) -> Result<()> {
            self.0.lock().unwrap().cpus = cpus.to_vec();
            Ok(())
        }

        fn unshare_user_namespace(&mut self) -> Result<()> {
            let mut k = self.0.lock().unwrap();
            if k.deny_user_namespace {
                return Err(JailError::Namespace("EPERM".to_string()));
            }
            k.user_namespace = true;
            k.bounding = CapSet::full();
            Ok(())
        }

        fn set_no_new_privs(&mut self) -> Result<()> {
            self.0.lock().unwrap().no_new_privs = true;
            Ok(())
        }

        fn load_filter(&mut self, path: &Path) -> Result<()> {
            self.0.lock().unwrap().loaded.push(path.to_path_buf());
            Ok(())
        }
    }

    /// Compiler that writes a placeholder program and records calls
    #[derive(Default)]
    pub struct RecordingCompiler {
        pub calls: Vec<String>,
    }

    impl FilterCompiler for RecordingCompiler {
        fn compile_protocol(&mut self, spec: &str, out: &Path) -> Result<()> {
            self.calls.push(format!("protocol {}", spec));
            std::fs::write(out, [0u8; 8])?;
            Ok(())
        }

        fn compile_general(&mut self, filter: &GeneralFilter, out: &Path) -> Result<()> {
            self.calls.push(format!("general {:?}", filter.class()));
            std::fs::write(out, [0u8; 8])?;
            Ok(())
        }

        fn compile_memory_deny_write_execute(&mut self, out: &Path) -> Result<()> {
            self.calls.push("mdwx".to_string());
            std::fs::write(out, [0u8; 8])?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeBackend, RecordingCompiler};
    use super::*;
    use crate::config::types::{ProgramSpec, SeccompPolicy};

    fn config() -> SessionConfig {
        SessionConfig {
            program: ProgramSpec::Direct {
                argv: vec!["true".to_string()],
            },
            user: Credentials::new(1000, 1000),
            ..SessionConfig::default()
        }
    }

    fn engine(config: &SessionConfig, dir: &Path) -> (PrivilegeEngine, FakeBackend) {
        let backend = FakeBackend::new();
        let engine = PrivilegeEngine::new(
            EffectivePolicy::from_config(config),
            config.user,
            Box::new(backend.clone()),
            RunFiles::with_owner(dir, None),
        );
        (engine, backend)
    }

    #[test]
    fn drop_all_with_default_filter_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.capabilities = CapabilityPolicy::DropAll;
        cfg.seccomp = SeccompPolicy {
            enabled: true,
            ..SeccompPolicy::default()
        };
        let (mut engine, backend) = engine(&cfg, dir.path());
        let mut compiler = RecordingCompiler::default();

        engine.apply_capabilities().unwrap();
        engine.persist_groups_marker().unwrap();
        engine.stage_filters(&mut compiler).unwrap();
        engine.load_filters().unwrap();

        let state = engine.state();
        assert_eq!(state.capabilities, Some(CapSet::empty()));
        assert!(backend.0.lock().unwrap().bounding.is_empty());
        assert_eq!(state.general_filter, Some(GeneralFilterClass::Default));
        assert_eq!(
            state.loaded_filters,
            vec![FilterStage::General(GeneralFilterClass::Default)]
        );
        assert!(!state.drop_groups);
        assert!(!dir.path().join("groups").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("caps")).unwrap(),
            "0000000000000000"
        );
    }

    #[test]
    fn confinement_overrides_caller_lists() {
        let mut cfg = config();
        cfg.enforce_confinement = true;
        cfg.capabilities = CapabilityPolicy::KeepList(vec!["cap_net_raw".to_string()]);
        cfg.seccomp = SeccompPolicy {
            enabled: true,
            keep: Some(vec!["read".to_string(), "write".to_string()]),
            ..SeccompPolicy::default()
        };

        let policy = EffectivePolicy::from_config(&cfg);
        assert_eq!(policy.capabilities, CapabilityPolicy::DropAll);
        assert_eq!(
            policy.general_filter,
            Some(GeneralFilter::Default { extra: vec![] })
        );
        assert!(policy.drop_groups);
        assert!(!policy.needs_postexec());

        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _backend) = engine(&cfg, dir.path());
        assert!(engine.apply_capabilities().unwrap().is_empty());
        engine.persist_groups_marker().unwrap();
        assert!(engine.state().drop_groups);
        assert!(dir.path().join("groups").exists());
    }

    #[test]
    fn reapplying_after_user_namespace_restores_same_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.capabilities = CapabilityPolicy::DropList(vec!["cap_sys_admin".to_string()]);
        let (mut engine, backend) = engine(&cfg, dir.path());

        let first = engine.apply_capabilities().unwrap();
        assert!(engine.create_user_namespace().is_none());
        assert_eq!(backend.0.lock().unwrap().bounding, CapSet::full());

        engine.reapply_after_user_namespace().unwrap();
        assert_eq!(backend.0.lock().unwrap().bounding, first);
        assert_eq!(engine.state().capabilities, Some(first));

        // A second reset and application is still the same set.
        backend.reset_bounding();
        engine.apply_capabilities().unwrap();
        assert_eq!(backend.0.lock().unwrap().bounding, first);
    }

    #[test]
    fn denied_user_namespace_is_a_soft_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, backend) = engine(&config(), dir.path());
        backend.0.lock().unwrap().deny_user_namespace = true;

        let warning = engine.create_user_namespace();
        assert!(matches!(warning, Some(SoftWarning::UserNamespaceDenied(_))));
        assert!(!engine.state().user_namespace);

        // Without a namespace nothing is re-applied.
        engine.reapply_after_user_namespace().unwrap();
        assert_eq!(engine.state().capabilities, None);
    }

    #[test]
    fn filters_load_in_fixed_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.seccomp = SeccompPolicy {
            enabled: true,
            protocol: Some("unix,inet".to_string()),
            memory_deny_write_execute: true,
            ..SeccompPolicy::default()
        };
        let (mut engine, backend) = engine(&cfg, dir.path());
        let mut compiler = RecordingCompiler::default();

        engine.stage_protocol_filter(&mut compiler).unwrap();
        engine.stage_filters(&mut compiler).unwrap();
        engine.load_filters().unwrap();

        assert_eq!(
            engine.state().loaded_filters,
            vec![
                FilterStage::Protocol,
                FilterStage::General(GeneralFilterClass::Default),
                FilterStage::MemoryDenyWriteExecute,
            ]
        );
        let kernel = backend.0.lock().unwrap();
        assert!(kernel.no_new_privs);
        assert_eq!(kernel.loaded.len(), 3);
        assert!(kernel.loaded[0].ends_with("seccomp.protocol"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("protocol")).unwrap(),
            "unix,inet\n"
        );
        let listing = std::fs::read_to_string(dir.path().join("seccomp")).unwrap();
        assert_eq!(listing.lines().count(), 3);
    }

    #[test]
    fn privileged_load_leaves_no_new_privs_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.seccomp.enabled = true;
        let (mut engine, backend) = engine(&cfg, dir.path());
        backend.0.lock().unwrap().effective = CapSet::full();
        let mut compiler = RecordingCompiler::default();

        engine.stage_filters(&mut compiler).unwrap();
        engine.load_filters().unwrap();

        let kernel = backend.0.lock().unwrap();
        assert!(!kernel.no_new_privs);
        assert_eq!(kernel.loaded.len(), 1);
        assert!(!engine.state().no_new_privs);
    }

    #[test]
    fn affinity_persists_previous_mask() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, backend) = engine(&config(), dir.path());

        engine.apply_affinity(&[1]).unwrap();
        assert_eq!(backend.0.lock().unwrap().cpus, vec![1]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cpu")).unwrap(),
            "0,1,2,3"
        );

        engine.apply_rlimits(&ResourceLimits {
            nproc: Some(50),
            ..ResourceLimits::default()
        })
        .unwrap();
        assert_eq!(
            engine.state().rlimits,
            vec![(ResourceLimit::Processes, 50)]
        );
    }
}
