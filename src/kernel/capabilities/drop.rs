//! Kernel side of capability handling. Every call here is idempotent.
use super::{CapSet, Capability, PR_CAPBSET_DROP, PR_CAPBSET_READ, PR_SET_NO_NEW_PRIVS};
use crate::config::types::{JailError, Result};

/// Current bounding set of the calling thread.
pub fn read_bounding_set() -> Result<CapSet> {
    let mut set = CapSet::empty();
    for cap in Capability::all() {
        // SAFETY: prctl(PR_CAPBSET_READ) only reads thread state.
        let result = unsafe { libc::prctl(PR_CAPBSET_READ, cap.value() as libc::c_ulong, 0, 0, 0) };
        match result {
            1 => set.insert(cap),
            0 => {}
            // Capability numbers past the kernel's CAP_LAST_CAP report EINVAL.
            _ => break,
        }
    }
    Ok(set)
}

pub fn drop_bounding_capability(cap: Capability) -> Result<()> {
    // SAFETY: prctl(PR_CAPBSET_DROP) takes a plain capability number.
    let result = unsafe { libc::prctl(PR_CAPBSET_DROP, cap.value() as libc::c_ulong, 0, 0, 0) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINVAL) {
            log::debug!("{} not supported by this kernel, skipping", cap);
            return Ok(());
        }
        return Err(JailError::Privilege(format!("Failed to drop {}: {}", cap, err)));
    }
    Ok(())
}

/// Effective set of the calling process, from `/proc/self/status`.
pub fn read_effective_set() -> Result<CapSet> {
    let status = std::fs::read_to_string("/proc/self/status")?;
    effective_from_status(&status)
}

/// Parse the `CapEff:` line of a proc status file.
pub fn effective_from_status(status: &str) -> Result<CapSet> {
    let hex = status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .map(str::trim)
        .ok_or_else(|| JailError::Privilege("no CapEff line in process status".to_string()))?;
    let bits = u64::from_str_radix(hex, 16)
        .map_err(|e| JailError::Privilege(format!("bad CapEff value {:?}: {}", hex, e)))?;
    Ok(CapSet::from_bits(bits))
}

/// Prevent privilege escalation via execve (setuid, file capabilities).
/// Irreversible once set.
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1) is safe and idempotent.
    let result = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if result != 0 {
        return Err(JailError::Privilege(format!(
            "Failed to set PR_SET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    log::debug!("Set PR_SET_NO_NEW_PRIVS");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_set_is_readable() {
        let set = read_bounding_set().unwrap();
        assert_eq!(set.bits() & !CapSet::full().bits(), 0);
    }

    #[test]
    fn effective_set_comes_from_cap_eff() {
        let status = "Name:\tsh\nCapInh:\t0000000000000000\nCapEff:\t0000000000200000\n";
        let set = effective_from_status(status).unwrap();
        assert!(set.contains(Capability::SYS_ADMIN));
        assert_eq!(set.bits(), 1 << 21);

        assert!(effective_from_status("Name:\tsh\n").is_err());
        assert!(read_effective_set().is_ok());
    }
}
