//! Filesystem setup inside the sandbox mount namespace
//!
//! The bootstrap describes each change as an [`FsAction`] and hands it to a
//! [`FilesystemEngine`]. Every applied action is recorded in an
//! [`FsActionLog`] that ends up in the `fslogger` state file.

pub mod filesystem;

pub use filesystem::MountFilesystem;

use crate::config::types::{Credentials, DeviceClass, PrivateHome, Result};
use crate::safety::run_files::RunFiles;
use std::net::IpAddr;
use std::path::PathBuf;

/// One filesystem change, in the order the bootstrap issues them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsAction {
    /// Private tmpfs work area for session state
    MountWorkArea(PathBuf),
    /// Stage `/etc/ld.so.preload` pointing at the tracer library
    StagePreload(PathBuf),
    /// Keep a copy of the hosts file before `/etc` changes
    StoreHostsFile(PathBuf),
    PrivateHome {
        mode: PrivateHome,
        home: PathBuf,
        owner: Credentials,
    },
    PrivateDev,
    /// Replace `dir` with a tmpfs holding copies of `keep`
    PrivateDir { dir: PathBuf, keep: Vec<String> },
    PrivateTmp,
    DisableSessionBus { owner: Credentials },
    HostnameFile(String),
    MountHostsFile,
    /// Bind `/etc/netns/<name>` entries over `/etc`
    NetnsOverrides(String),
    /// Fresh `/proc`, read-only `/sys`, hidden `/boot`
    NormalizeSystemDirs,
    DisableMnt,
    Whitelist(Vec<PathBuf>),
    Blacklist(Vec<PathBuf>),
    DisableAudioServer { home: PathBuf },
    InitAudioServer { home: PathBuf, owner: Credentials },
    DisableDevices(DeviceClass),
    ConfigureDns(Vec<IpAddr>),
    /// Bind the staged preload file over `/etc/ld.so.preload`
    InstallTrace,
    CleanX11,
}

impl FsAction {
    /// Log line recorded for the action.
    pub fn describe(&self) -> String {
        match self {
            FsAction::MountWorkArea(dir) => format!("mount tmpfs on {}", dir.display()),
            FsAction::StagePreload(lib) => format!("stage ld.so.preload for {}", lib.display()),
            FsAction::StoreHostsFile(src) => format!("store hosts file {}", src.display()),
            FsAction::PrivateHome { mode, home, .. } => match mode {
                PrivateHome::Disabled => format!("keep home {}", home.display()),
                PrivateHome::Empty => format!("mount tmpfs on {}", home.display()),
                PrivateHome::Directory(dir) => {
                    format!("mount {} on {}", dir.display(), home.display())
                }
                PrivateHome::Keep(list) => {
                    format!("private home {} keeping {}", home.display(), list.join(","))
                }
            },
            FsAction::PrivateDev => "mount tmpfs on /dev".to_string(),
            FsAction::PrivateDir { dir, keep } if keep.is_empty() => {
                format!("mount tmpfs on {}", dir.display())
            }
            FsAction::PrivateDir { dir, keep } => {
                format!("private {} keeping {}", dir.display(), keep.join(","))
            }
            FsAction::PrivateTmp => "mount tmpfs on /tmp".to_string(),
            FsAction::DisableSessionBus { .. } => "disable session bus".to_string(),
            FsAction::HostnameFile(name) => format!("create /etc/hostname ({})", name),
            FsAction::MountHostsFile => "mount stored hosts file on /etc/hosts".to_string(),
            FsAction::NetnsOverrides(name) => format!("mount /etc/netns/{} overrides", name),
            FsAction::NormalizeSystemDirs => "remount /proc /sys /dev /boot".to_string(),
            FsAction::DisableMnt => "disable /mnt and /media".to_string(),
            FsAction::Whitelist(paths) => format!("whitelist {}", join_paths(paths)),
            FsAction::Blacklist(paths) => format!("blacklist {}", join_paths(paths)),
            FsAction::DisableAudioServer { .. } => "disable audio server".to_string(),
            FsAction::InitAudioServer { .. } => "configure audio server client".to_string(),
            FsAction::DisableDevices(class) => format!("disable {:?} devices", class),
            FsAction::ConfigureDns(servers) => {
                let list: Vec<String> = servers.iter().map(|s| s.to_string()).collect();
                format!("create /etc/resolv.conf ({})", list.join(","))
            }
            FsAction::InstallTrace => "mount ld.so.preload on /etc/ld.so.preload".to_string(),
            FsAction::CleanX11 => "clean /tmp/.X11-unix".to_string(),
        }
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// In-memory action log, flushed to `<run_dir>/mnt/fslogger`
#[derive(Debug, Default, Clone)]
pub struct FsActionLog {
    lines: Vec<String>,
}

impl FsActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Write the log and hand it to `owner` so the user can read it back.
    pub fn flush(&self, files: &RunFiles, owner: Credentials) -> Result<PathBuf> {
        let path = files.path(crate::safety::run_files::RunFile::FsLogger);
        files.write_owned(&path, &self.render(), Some((owner.uid, owner.gid)))?;
        Ok(path)
    }
}

/// Filesystem collaborator driven by the bootstrap
pub trait FilesystemEngine {
    fn apply(&mut self, action: &FsAction) -> Result<()>;

    /// Persist the action log owned by `owner`.
    fn flush_log(&mut self, files: &RunFiles, owner: Credentials) -> Result<()>;
}
