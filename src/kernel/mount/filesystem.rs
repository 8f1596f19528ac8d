/// Kernel-backed filesystem engine
/// Tmpfs overlays, bind mounts and stashed copies inside the sandbox mount
/// namespace. All stash areas live under the session work area.
use super::{FilesystemEngine, FsAction, FsActionLog};
use crate::config::types::{Credentials, DeviceClass, JailError, PrivateHome, Result};
use crate::safety::run_files::RunFiles;
use std::ffi::CString;
use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::{chown, PermissionsExt};
use std::path::{Path, PathBuf};

const PRELOAD_TARGET: &str = "/etc/ld.so.preload";
const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Essential nodes recreated on a private /dev
const MINIMAL_DEVICES: &[(&str, u32, u32)] = &[
    ("null", 1, 3),
    ("zero", 1, 5),
    ("full", 1, 7),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

/// Device nodes hidden for each denied class
pub fn device_paths(class: DeviceClass) -> &'static [&'static str] {
    match class {
        DeviceClass::Sound => &["/dev/snd"],
        DeviceClass::ThreeD => &["/dev/dri", "/dev/nvidia0", "/dev/nvidiactl", "/dev/nvidia-modeset"],
        DeviceClass::Tv => &["/dev/dvb"],
        DeviceClass::Dvd => &["/dev/sr0", "/dev/sr1", "/dev/cdrom", "/dev/dvd"],
        DeviceClass::Video => &["/dev/video0", "/dev/video1", "/dev/video2", "/dev/video3"],
    }
}

pub fn resolv_conf(servers: &[IpAddr]) -> String {
    servers
        .iter()
        .map(|s| format!("nameserver {}\n", s))
        .collect()
}

/// Filesystem engine acting on the current mount namespace
#[derive(Debug)]
pub struct MountFilesystem {
    /// Session work area (`<run_dir>/mnt`)
    work_dir: PathBuf,
    log: FsActionLog,
    stored_hosts: Option<PathBuf>,
    staged_preload: Option<PathBuf>,
}

impl MountFilesystem {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let mut log = FsActionLog::new();
        log.record("sandbox filesystem: local");
        log.record("install mount namespace");
        Self {
            work_dir: work_dir.into(),
            log,
            stored_hosts: None,
            staged_preload: None,
        }
    }

    pub fn log(&self) -> &FsActionLog {
        &self.log
    }

    fn stash(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    fn mount_tmpfs(&self, target: &Path, options: &str) -> Result<()> {
        mount_raw(
            Some("tmpfs"),
            target,
            Some("tmpfs"),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_STRICTATIME,
            Some(options),
        )
    }

    fn bind(&self, source: &Path, target: &Path) -> Result<()> {
        mount_raw(
            Some(&source.to_string_lossy()),
            target,
            None,
            libc::MS_BIND | libc::MS_REC,
            None,
        )
    }

    fn bind_read_only(&self, source: &Path, target: &Path) -> Result<()> {
        self.bind(source, target)?;
        mount_raw(
            None,
            target,
            None,
            libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV,
            None,
        )
    }

    fn private_home(&self, mode: &PrivateHome, home: &Path, owner: Credentials) -> Result<()> {
        match mode {
            PrivateHome::Disabled => Ok(()),
            PrivateHome::Empty => {
                self.mount_tmpfs(home, "mode=755")?;
                chown(home, Some(owner.uid), Some(owner.gid))?;
                if !owner.is_root() && Path::new("/root").exists() {
                    self.mount_tmpfs(Path::new("/root"), "mode=700")?;
                }
                Ok(())
            }
            PrivateHome::Directory(dir) => {
                if !dir.is_dir() {
                    return Err(JailError::Filesystem(format!(
                        "private home {} is not a directory",
                        dir.display()
                    )));
                }
                self.bind(dir, home)
            }
            PrivateHome::Keep(entries) => {
                let stash = self.stash("home");
                copy_entries(home, &stash, entries)?;
                self.mount_tmpfs(home, "mode=755")?;
                copy_directory_contents(&stash, home)?;
                chown_tree(home, owner)?;
                Ok(())
            }
        }
    }

    fn private_dir(&self, dir: &Path, keep: &[String]) -> Result<()> {
        if keep.is_empty() {
            return self.mount_tmpfs(dir, "mode=755");
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let stash = self.stash(&name);
        copy_entries(dir, &stash, keep)?;
        self.bind(&stash, dir)
    }

    fn private_dev(&self) -> Result<()> {
        let stash = self.stash("dev");
        fs::create_dir_all(&stash)?;
        // Keep the pty and shm mounts of the host /dev.
        let keep_dirs = ["pts", "shm"];
        for name in keep_dirs {
            let src = Path::new("/dev").join(name);
            if src.is_dir() {
                let dst = stash.join(name);
                fs::create_dir_all(&dst)?;
                self.bind(&src, &dst)?;
            }
        }

        mount_raw(
            Some("tmpfs"),
            Path::new("/dev"),
            Some("tmpfs"),
            libc::MS_NOSUID | libc::MS_STRICTATIME,
            Some("mode=755,gid=0"),
        )?;
        create_minimal_devices(Path::new("/dev"))?;

        for name in keep_dirs {
            let src = stash.join(name);
            if src.is_dir() {
                let dst = Path::new("/dev").join(name);
                fs::create_dir_all(&dst)?;
                self.bind(&src, &dst)?;
            }
        }
        Ok(())
    }

    /// Dirs get an empty read-only tmpfs, files an empty read-only file.
    fn blacklist_path(&self, path: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(_) => {
                log::debug!("Blacklist target {} not present", path.display());
                return Ok(());
            }
        };
        if meta.is_dir() {
            mount_raw(
                Some("tmpfs"),
                path,
                Some("tmpfs"),
                libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
                Some("mode=400"),
            )
        } else {
            let empty = self.stash("empty");
            if !empty.exists() {
                fs::write(&empty, b"")?;
                fs::set_permissions(&empty, fs::Permissions::from_mode(0o400))?;
            }
            self.bind_read_only(&empty, path)
        }
    }

    /// Stash each whitelisted path, cover its parent with a tmpfs, then
    /// bind the stashed path back.
    fn whitelist(&self, paths: &[PathBuf]) -> Result<()> {
        let stash_root = self.stash("whitelist");
        fs::create_dir_all(&stash_root)?;

        let mut staged = Vec::new();
        for (index, path) in paths.iter().enumerate() {
            let meta = match fs::metadata(path) {
                Ok(meta) => meta,
                Err(_) => {
                    log::debug!("Whitelist target {} not present", path.display());
                    continue;
                }
            };
            let stash = stash_root.join(index.to_string());
            if meta.is_dir() {
                fs::create_dir_all(&stash)?;
            } else {
                fs::write(&stash, b"")?;
            }
            self.bind(path, &stash)?;
            staged.push((path.clone(), stash, meta.is_dir()));
        }

        let mut covered: Vec<PathBuf> = Vec::new();
        for (path, _, _) in &staged {
            if let Some(parent) = path.parent() {
                if !covered.iter().any(|c| c == parent) {
                    self.mount_tmpfs(parent, "mode=755")?;
                    covered.push(parent.to_path_buf());
                }
            }
        }

        for (path, stash, is_dir) in staged {
            if is_dir {
                fs::create_dir_all(&path)?;
            } else {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, b"")?;
            }
            self.bind(&stash, &path)?;
        }
        Ok(())
    }

    fn normalize_system_dirs(&self) -> Result<()> {
        mount_raw(
            Some("proc"),
            Path::new("/proc"),
            Some("proc"),
            libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_NODEV,
            None,
        )?;
        let proc_sys = Path::new("/proc/sys");
        self.bind_read_only(proc_sys, proc_sys)?;

        if Path::new("/sys").is_dir() {
            let flags = libc::MS_BIND
                | libc::MS_REMOUNT
                | libc::MS_RDONLY
                | libc::MS_NOSUID
                | libc::MS_NOEXEC
                | libc::MS_NODEV;
            if let Err(e) = mount_raw(None, Path::new("/sys"), None, flags, None) {
                log::warn!("Cannot remount /sys read-only: {}", e);
            }
        }
        for hidden in ["/boot", "/sys/firmware"] {
            if Path::new(hidden).is_dir() {
                self.blacklist_path(Path::new(hidden))?;
            }
        }
        Ok(())
    }

    fn write_and_bind(&self, name: &str, contents: &str, target: &Path) -> Result<()> {
        let staged = self.stash(name);
        fs::write(&staged, contents)?;
        fs::set_permissions(&staged, fs::Permissions::from_mode(0o644))?;
        if !target.exists() {
            fs::write(target, b"")?;
        }
        self.bind(&staged, target)
    }

    fn pulse_config(home: &Path) -> PathBuf {
        home.join(".config/pulse/client.conf")
    }

    fn apply_action(&mut self, action: &FsAction) -> Result<()> {
        match action {
            FsAction::MountWorkArea(dir) => {
                fs::create_dir_all(dir)?;
                self.mount_tmpfs(dir, "mode=755,gid=0")?;
                self.work_dir = dir.clone();
                Ok(())
            }
            FsAction::StagePreload(library) => {
                let staged = self.stash("ld.so.preload");
                fs::write(&staged, format!("{}\n", library.display()))?;
                fs::set_permissions(&staged, fs::Permissions::from_mode(0o644))?;
                self.staged_preload = Some(staged);
                Ok(())
            }
            FsAction::StoreHostsFile(source) => {
                let stored = self.stash("hosts");
                fs::copy(source, &stored).map_err(|e| {
                    JailError::Filesystem(format!(
                        "cannot store hosts file {}: {}",
                        source.display(),
                        e
                    ))
                })?;
                self.stored_hosts = Some(stored);
                Ok(())
            }
            FsAction::PrivateHome { mode, home, owner } => self.private_home(mode, home, *owner),
            FsAction::PrivateDev => self.private_dev(),
            FsAction::PrivateDir { dir, keep } => self.private_dir(dir, keep),
            FsAction::PrivateTmp => {
                self.mount_tmpfs(Path::new("/tmp"), "mode=1777")
            }
            FsAction::DisableSessionBus { owner } => {
                let socket = PathBuf::from(format!("/run/user/{}/bus", owner.uid));
                self.blacklist_path(&socket)
            }
            FsAction::HostnameFile(name) => {
                self.write_and_bind("hostname", &format!("{}\n", name), Path::new("/etc/hostname"))
            }
            FsAction::MountHostsFile => match &self.stored_hosts {
                Some(stored) => self.bind(stored, Path::new("/etc/hosts")),
                None => Err(JailError::Filesystem("no stored hosts file".to_string())),
            },
            FsAction::NetnsOverrides(name) => {
                let overrides = Path::new("/etc/netns").join(name);
                let entries = match fs::read_dir(&overrides) {
                    Ok(entries) => entries,
                    Err(_) => return Ok(()),
                };
                for entry in entries {
                    let entry = entry?;
                    let target = Path::new("/etc").join(entry.file_name());
                    if target.exists() {
                        self.bind(&entry.path(), &target)?;
                    }
                }
                Ok(())
            }
            FsAction::NormalizeSystemDirs => self.normalize_system_dirs(),
            FsAction::DisableMnt => {
                for dir in ["/mnt", "/media", "/run/media"] {
                    if Path::new(dir).is_dir() {
                        self.blacklist_path(Path::new(dir))?;
                    }
                }
                Ok(())
            }
            FsAction::Whitelist(paths) => self.whitelist(paths),
            FsAction::Blacklist(paths) => {
                for path in paths {
                    self.blacklist_path(path)?;
                }
                Ok(())
            }
            FsAction::DisableAudioServer { home } => {
                let conf = Self::pulse_config(home);
                if conf.exists() {
                    self.write_and_bind("pulse-client.conf", "autospawn = no\n", &conf)?;
                }
                let runtime = Path::new("/run/user");
                if runtime.is_dir() {
                    for entry in fs::read_dir(runtime)? {
                        let pulse = entry?.path().join("pulse");
                        if pulse.is_dir() {
                            self.blacklist_path(&pulse)?;
                        }
                    }
                }
                Ok(())
            }
            FsAction::InitAudioServer { home, owner } => {
                let conf = Self::pulse_config(home);
                if conf.exists() {
                    let mut contents = fs::read_to_string(&conf)?;
                    contents.push_str("\nenable-shm = no\n");
                    self.write_and_bind("pulse-client.conf", &contents, &conf)?;
                    chown(self.stash("pulse-client.conf"), Some(owner.uid), Some(owner.gid))?;
                }
                Ok(())
            }
            FsAction::DisableDevices(class) => {
                for path in device_paths(*class) {
                    self.blacklist_path(Path::new(path))?;
                }
                Ok(())
            }
            FsAction::ConfigureDns(servers) => {
                if servers.is_empty() {
                    return Ok(());
                }
                self.write_and_bind("resolv.conf", &resolv_conf(servers), Path::new("/etc/resolv.conf"))
            }
            FsAction::InstallTrace => match &self.staged_preload {
                Some(staged) => {
                    if !Path::new(PRELOAD_TARGET).exists() {
                        fs::write(PRELOAD_TARGET, b"")?;
                    }
                    self.bind(staged, Path::new(PRELOAD_TARGET))
                }
                None => Err(JailError::Filesystem("tracer library not staged".to_string())),
            },
            FsAction::CleanX11 => {
                let dir = Path::new(X11_SOCKET_DIR);
                if dir.is_dir() && std::env::var_os("DISPLAY").is_none() {
                    self.mount_tmpfs(dir, "mode=1777")?;
                }
                Ok(())
            }
        }
    }
}

impl FilesystemEngine for MountFilesystem {
    fn apply(&mut self, action: &FsAction) -> Result<()> {
        self.apply_action(action)?;
        let line = action.describe();
        log::debug!("{}", line);
        self.log.record(line);
        Ok(())
    }

    fn flush_log(&mut self, files: &RunFiles, owner: Credentials) -> Result<()> {
        self.log.flush(files, owner)?;
        Ok(())
    }
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.to_string_lossy().as_bytes())
        .map_err(|e| JailError::Mount(format!("Invalid path {}: {}", path.display(), e)))
}

fn mount_raw(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> Result<()> {
    let source_cstr = source
        .map(CString::new)
        .transpose()
        .map_err(|e| JailError::Mount(format!("Invalid source string: {}", e)))?;
    let target_cstr = path_cstring(target)?;
    let fstype_cstr = fstype
        .map(CString::new)
        .transpose()
        .map_err(|e| JailError::Mount(format!("Invalid fstype string: {}", e)))?;
    let data_cstr = data
        .map(CString::new)
        .transpose()
        .map_err(|e| JailError::Mount(format!("Invalid options string: {}", e)))?;

    // SAFETY: every pointer is either null or a NUL-terminated string that
    // outlives the call.
    let result = unsafe {
        libc::mount(
            source_cstr.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            target_cstr.as_ptr(),
            fstype_cstr.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            data_cstr
                .as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr() as *const libc::c_void),
        )
    };

    if result != 0 {
        let err = std::io::Error::last_os_error();
        return Err(JailError::Mount(format!(
            "mount on {} failed: {}",
            target.display(),
            err
        )));
    }
    Ok(())
}

/// Create minimal essential device nodes
fn create_minimal_devices(dev_path: &Path) -> Result<()> {
    for (name, major, minor) in MINIMAL_DEVICES {
        let device_path = dev_path.join(name);
        let path_cstr = path_cstring(&device_path)?;

        // SAFETY: path_cstr is a valid NUL-terminated path.
        let result = unsafe {
            libc::mknod(
                path_cstr.as_ptr(),
                libc::S_IFCHR | 0o666,
                libc::makedev(*major, *minor),
            )
        };

        if result != 0 {
            log::warn!(
                "Failed to create device {}: {}",
                name,
                std::io::Error::last_os_error()
            );
        } else {
            fs::set_permissions(&device_path, fs::Permissions::from_mode(0o666))?;
            log::debug!("Created device node: {}", device_path.display());
        }
    }
    Ok(())
}

/// Copy the named entries of `source` into a fresh `stash`.
fn copy_entries(source: &Path, stash: &Path, entries: &[String]) -> Result<()> {
    fs::create_dir_all(stash)?;
    for entry in entries {
        let name = entry.trim_matches('/');
        if name.is_empty() || name.split('/').any(|part| part == "..") {
            return Err(JailError::Config(format!("invalid private entry {:?}", entry)));
        }
        let from = source.join(name);
        let to = stash.join(name);
        if !from.exists() {
            log::debug!("Private entry {} not present", from.display());
            continue;
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if from.is_dir() {
            copy_directory_contents(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn copy_directory_contents(source: &Path, target: &Path) -> Result<()> {
    if !target.exists() {
        fs::create_dir_all(target)?;
    }

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let source_path = entry.path();
        let target_path = target.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_directory_contents(&source_path, &target_path)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(&source_path)?;
            std::os::unix::fs::symlink(link, &target_path)?;
        } else {
            fs::copy(&source_path, &target_path)?;
        }
    }
    Ok(())
}

fn chown_tree(path: &Path, owner: Credentials) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(owner.uid), Some(owner.gid))?;
    if fs::symlink_metadata(path)?.is_dir() {
        for entry in fs::read_dir(path)? {
            chown_tree(&entry?.path(), owner)?;
        }
    }
    Ok(())
}
