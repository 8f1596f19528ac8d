/// Persisted session state under `<run_dir>/mnt`
/// Read back by inspection tools, so every file is written with explicit
/// ownership and permission bits.
use crate::config::types::{JailError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{fchown, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

const STATE_FILE_MODE: u32 = 0o644;

/// Well-known state files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFile {
    /// Hex capability bounding mask
    Caps,
    /// Loaded filter files, one per line in load order
    Seccomp,
    /// Protocol filter spec as configured
    Protocol,
    /// Affinity mask before the sandbox changed it
    Cpu,
    Cgroup,
    /// Present when supplementary groups are dropped
    Groups,
    /// Filesystem action log
    FsLogger,
}

impl RunFile {
    pub fn file_name(self) -> &'static str {
        match self {
            RunFile::Caps => "caps",
            RunFile::Seccomp => "seccomp",
            RunFile::Protocol => "protocol",
            RunFile::Cpu => "cpu",
            RunFile::Cgroup => "cgroup",
            RunFile::Groups => "groups",
            RunFile::FsLogger => "fslogger",
        }
    }
}

/// Writer for files in the session's private work area
#[derive(Debug, Clone)]
pub struct RunFiles {
    mnt_dir: PathBuf,
    /// Owner applied to state files; `None` leaves the creating user
    owner: Option<(u32, u32)>,
}

impl RunFiles {
    /// Files owned by root, the production layout.
    pub fn new(mnt_dir: impl Into<PathBuf>) -> Self {
        Self {
            mnt_dir: mnt_dir.into(),
            owner: Some((0, 0)),
        }
    }

    pub fn with_owner(mnt_dir: impl Into<PathBuf>, owner: Option<(u32, u32)>) -> Self {
        Self {
            mnt_dir: mnt_dir.into(),
            owner,
        }
    }

    pub fn mnt_dir(&self) -> &Path {
        &self.mnt_dir
    }

    pub fn path(&self, file: RunFile) -> PathBuf {
        self.mnt_dir.join(file.file_name())
    }

    /// Path for an arbitrary artifact inside the work area.
    pub fn artifact(&self, name: &str) -> PathBuf {
        self.mnt_dir.join(name)
    }

    pub fn write(&self, file: RunFile, contents: &str) -> Result<PathBuf> {
        let path = self.path(file);
        self.write_owned(&path, contents, self.owner)?;
        Ok(path)
    }

    /// Write with an explicit owner, e.g. the filesystem log handed to the user.
    pub fn write_owned(&self, path: &Path, contents: &str, owner: Option<(u32, u32)>) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(STATE_FILE_MODE)
            .open(path)
            .map_err(|e| {
                JailError::Filesystem(format!("cannot create {}: {}", path.display(), e))
            })?;
        file.write_all(contents.as_bytes())?;

        if let Some((uid, gid)) = owner {
            fchown(&file, Some(uid), Some(gid)).map_err(|e| {
                JailError::Filesystem(format!("cannot chown {}: {}", path.display(), e))
            })?;
        }
        // Creation mode is filtered by umask; set the bits explicitly.
        fs::set_permissions(path, fs::Permissions::from_mode(STATE_FILE_MODE))?;
        Ok(())
    }

    /// Pre-create an artifact the unprivileged helper is going to fill in.
    pub fn prepare_for_user(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        let owner = self.owner.map(|_| (uid, gid));
        self.write_owned(path, "", owner)
    }

    /// Hand an artifact back to the state-file owner.
    pub fn seal(&self, path: &Path) -> Result<()> {
        if let Some((uid, gid)) = self.owner {
            std::os::unix::fs::chown(path, Some(uid), Some(gid)).map_err(|e| {
                JailError::Filesystem(format!("cannot chown {}: {}", path.display(), e))
            })?;
        }
        fs::set_permissions(path, fs::Permissions::from_mode(STATE_FILE_MODE))?;
        Ok(())
    }
}
