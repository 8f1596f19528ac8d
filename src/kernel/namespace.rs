/// Namespace creation and per-namespace setup
/// Covers the clone flags of the sandbox init, mount propagation, hostname,
/// and user namespace id mapping.
use crate::config::types::{Credentials, JailError, NetworkConfig, Result};

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{sethostname, Pid};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Inode number of the root directory of a filesystem that is not chrooted.
const CANONICAL_ROOT_INODE: u64 = 2;

/// Namespaces created when the sandbox init is cloned.
pub fn clone_flags(network: &NetworkConfig) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC;
    if network.needs_namespace() {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    flags
}

pub fn set_hostname(hostname: &str) -> Result<()> {
    sethostname(hostname).map_err(|e| {
        JailError::Namespace(format!("Failed to set hostname {}: {}", hostname, e))
    })?;
    log::debug!("Hostname set to {}", hostname);
    Ok(())
}

/// Whether a failed slave remount can be ignored: inside a container, or
/// when `/` is not the real root of its filesystem.
pub fn slave_failure_tolerated(in_container: bool, root_inode: Option<u64>) -> bool {
    in_container || root_inode != Some(CANONICAL_ROOT_INODE)
}

/// mount(NULL, "/", NULL, MS_SLAVE | MS_REC, NULL)
/// Host mount events still reach the sandbox; sandbox mounts never reach the host.
pub fn make_mounts_slave() -> Result<()> {
    let result = mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    );

    match result {
        Ok(()) => {
            log::debug!("Mount propagation set: / is MS_SLAVE|MS_REC");
            Ok(())
        }
        Err(e) => {
            let in_container = std::env::var_os("container").is_some();
            let root_inode = std::fs::metadata("/").ok().map(|m| m.ino());
            if slave_failure_tolerated(in_container, root_inode) {
                log::warn!("Cannot mount / as slave ({}), continuing", e);
                Ok(())
            } else {
                Err(JailError::Mount(format!(
                    "cannot mount filesystem as slave: {}",
                    e
                )))
            }
        }
    }
}

pub fn unshare_user_namespace() -> Result<()> {
    unshare(CloneFlags::CLONE_NEWUSER)
        .map_err(|e| JailError::Namespace(format!("Failed to unshare user namespace: {}", e)))
}

/// True when `pid` lives in a different user namespace than the caller.
pub fn in_separate_user_namespace(pid: Pid) -> Result<bool> {
    let ours = std::fs::read_link("/proc/self/ns/user")?;
    let theirs = std::fs::read_link(format!("/proc/{}/ns/user", pid))?;
    Ok(ours != theirs)
}

/// Single-entry maps: the invoking user is the only identity inside.
pub fn id_map_line(id: u32) -> String {
    format!("{} {} 1\n", id, id)
}

/// Write uid_map and gid_map of `pid` from the parent user namespace.
pub fn write_id_maps(pid: Pid, user: Credentials) -> Result<()> {
    let proc_dir = Path::new("/proc").join(pid.to_string());
    std::fs::write(proc_dir.join("uid_map"), id_map_line(user.uid)).map_err(|e| {
        JailError::Namespace(format!("Failed to write uid_map for {}: {}", pid, e))
    })?;
    std::fs::write(proc_dir.join("gid_map"), id_map_line(user.gid)).map_err(|e| {
        JailError::Namespace(format!("Failed to write gid_map for {}: {}", pid, e))
    })?;
    log::debug!("Mapped uid {} / gid {} into pid {}", user.uid, user.gid, pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::NetworkMode;

    #[test]
    fn network_namespace_only_when_required() {
        let host = NetworkConfig::default();
        assert!(!clone_flags(&host).contains(CloneFlags::CLONE_NEWNET));
        assert!(clone_flags(&host).contains(CloneFlags::CLONE_NEWPID));

        let none = NetworkConfig {
            mode: NetworkMode::None,
            ..NetworkConfig::default()
        };
        assert!(clone_flags(&none).contains(CloneFlags::CLONE_NEWNET));

        let netns = NetworkConfig {
            mode: NetworkMode::Namespace("blue".to_string()),
            ..NetworkConfig::default()
        };
        assert!(!clone_flags(&netns).contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn slave_failure_on_real_root_is_fatal() {
        assert!(!slave_failure_tolerated(false, Some(2)));
        assert!(slave_failure_tolerated(true, Some(2)));
        assert!(slave_failure_tolerated(false, Some(1234)));
        assert!(slave_failure_tolerated(false, None));
    }

    #[test]
    fn id_map_maps_only_the_user() {
        assert_eq!(id_map_line(1000), "1000 1000 1\n");
    }

    #[test]
    fn own_process_shares_user_namespace() {
        let me = Pid::this();
        assert!(!in_separate_user_namespace(me).unwrap());
    }
}
