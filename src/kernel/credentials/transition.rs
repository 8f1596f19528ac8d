//! Final UID/GID transition of the sandbox init.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid, otherwise the process
//! no longer has the privilege to change its group ids.

use super::validation::{plan_transition, TransitionPlan};
use crate::config::types::{Credentials, JailError, Result};

/// groups -> setresgid -> setresuid -> verify. Supplementary groups are kept
/// unless `drop_groups` is set.
pub fn drop_privileges(target: Credentials, drop_groups: bool) -> Result<()> {
    let plan = plan_transition(target)?;
    if drop_groups {
        clear_supplementary_groups()?;
    }
    let target = match plan {
        TransitionPlan::KeepRoot => {
            log::info!("Sandbox runs as root, keeping credentials");
            return Ok(());
        }
        TransitionPlan::Drop(target) => target,
    };

    // CRITICAL: GID before UID
    set_gid(target.gid)?;
    set_uid(target.uid)?;
    verify_transition(target)?;

    log::debug!("Transitioned to UID={}, GID={}", target.uid, target.gid);
    Ok(())
}

fn clear_supplementary_groups() -> Result<()> {
    nix::unistd::setgroups(&[]).map_err(|e| {
        JailError::Privilege(format!("Failed to clear supplementary groups: {}", e))
    })?;
    log::debug!("Cleared supplementary groups");
    Ok(())
}

fn set_gid(gid: u32) -> Result<()> {
    // SAFETY: setresgid atomically sets all three GIDs.
    let result =
        unsafe { libc::setresgid(gid as libc::gid_t, gid as libc::gid_t, gid as libc::gid_t) };
    if result != 0 {
        return Err(JailError::Privilege(format!(
            "Failed to setresgid({}): {}",
            gid,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn set_uid(uid: u32) -> Result<()> {
    // SAFETY: setresuid atomically sets all three UIDs. Called after setresgid.
    let result =
        unsafe { libc::setresuid(uid as libc::uid_t, uid as libc::uid_t, uid as libc::uid_t) };
    if result != 0 {
        return Err(JailError::Privilege(format!(
            "Failed to setresuid({}): {}",
            uid,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn verify_transition(expected: Credentials) -> Result<()> {
    use nix::unistd::{getegid, geteuid, getgid, getuid};

    let (ruid, euid) = (getuid().as_raw(), geteuid().as_raw());
    let (rgid, egid) = (getgid().as_raw(), getegid().as_raw());

    if ruid != expected.uid || euid != expected.uid {
        return Err(JailError::Privilege(format!(
            "UID verification failed: expected {}, got real={}, effective={}",
            expected.uid, ruid, euid
        )));
    }
    if rgid != expected.gid || egid != expected.gid {
        return Err(JailError::Privilege(format!(
            "GID verification failed: expected {}, got real={}, effective={}",
            expected.gid, rgid, egid
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_target_is_a_no_op() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        drop_privileges(Credentials::new(0, 0), false).unwrap();
        assert!(nix::unistd::geteuid().is_root());
    }

    #[test]
    fn root_target_still_clears_groups() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, getgroups, setgroups, ForkResult, Gid};

        if !nix::unistd::geteuid().is_root() {
            return;
        }
        // SAFETY: the child only makes syscalls and exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = if setgroups(&[Gid::from_raw(5)]).is_err() {
                    2
                } else if drop_privileges(Credentials::new(0, 0), true).is_err() {
                    3
                } else if !getgroups().map(|g| g.is_empty()).unwrap_or(false) {
                    4
                } else {
                    0
                };
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => {
                assert!(matches!(waitpid(child, None).unwrap(), WaitStatus::Exited(_, 0)));
            }
        }
    }

    #[test]
    fn mixed_target_fails_before_any_syscall() {
        let before = nix::unistd::geteuid();
        assert!(drop_privileges(Credentials::new(0, 1000), true).is_err());
        assert_eq!(nix::unistd::geteuid(), before);
    }
}
