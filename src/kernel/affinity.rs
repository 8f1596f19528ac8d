//! CPU affinity for the sandbox init and everything it forks.
use crate::config::types::{JailError, Result};
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

pub fn current_cpus() -> Result<Vec<usize>> {
    let set = sched_getaffinity(Pid::from_raw(0))
        .map_err(|e| JailError::Privilege(format!("sched_getaffinity: {}", e)))?;
    let mut cpus = Vec::new();
    for cpu in 0..CpuSet::count() {
        if set.is_set(cpu).unwrap_or(false) {
            cpus.push(cpu);
        }
    }
    Ok(cpus)
}

pub fn set_cpus(cpus: &[usize]) -> Result<()> {
    let mut set = CpuSet::new();
    for &cpu in cpus {
        set.set(cpu)
            .map_err(|e| JailError::Config(format!("invalid cpu {}: {}", cpu, e)))?;
    }
    sched_setaffinity(Pid::from_raw(0), &set)
        .map_err(|e| JailError::Privilege(format!("sched_setaffinity: {}", e)))?;
    log::debug!("Set cpu affinity to {:?}", cpus);
    Ok(())
}

/// Comma-separated list, the format of the `cpu` run file.
pub fn format_cpu_list(cpus: &[usize]) -> String {
    cpus.iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse `0,2-3` style lists.
pub fn parse_cpu_list(value: &str) -> Result<Vec<usize>> {
    let invalid = || JailError::Config(format!("Invalid cpu list: {:?}", value));
    let mut cpus = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.parse().map_err(|_| invalid())?;
                let hi: usize = hi.parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| invalid())?),
        }
    }
    if cpus.is_empty() {
        return Err(invalid());
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}
