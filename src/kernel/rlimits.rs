//! Resource limits applied to the sandbox before the target is forked.
use crate::config::types::{JailError, ResourceLimits, Result};
use nix::sys::resource::{setrlimit, Resource};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceLimit {
    OpenFiles,
    Processes,
    FileSize,
    PendingSignals,
    AddressSpace,
}

impl ResourceLimit {
    fn resource(self) -> Resource {
        match self {
            ResourceLimit::OpenFiles => Resource::RLIMIT_NOFILE,
            ResourceLimit::Processes => Resource::RLIMIT_NPROC,
            ResourceLimit::FileSize => Resource::RLIMIT_FSIZE,
            ResourceLimit::PendingSignals => Resource::RLIMIT_SIGPENDING,
            ResourceLimit::AddressSpace => Resource::RLIMIT_AS,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceLimit::OpenFiles => "RLIMIT_NOFILE",
            ResourceLimit::Processes => "RLIMIT_NPROC",
            ResourceLimit::FileSize => "RLIMIT_FSIZE",
            ResourceLimit::PendingSignals => "RLIMIT_SIGPENDING",
            ResourceLimit::AddressSpace => "RLIMIT_AS",
        }
    }
}

/// Configured limits in application order.
pub fn requested(limits: &ResourceLimits) -> Vec<(ResourceLimit, u64)> {
    [
        (ResourceLimit::OpenFiles, limits.nofile),
        (ResourceLimit::Processes, limits.nproc),
        (ResourceLimit::FileSize, limits.fsize),
        (ResourceLimit::PendingSignals, limits.sigpending),
        (ResourceLimit::AddressSpace, limits.address_space),
    ]
    .into_iter()
    .filter_map(|(limit, value)| value.map(|v| (limit, v)))
    .collect()
}

/// Set soft and hard limit to the same value.
pub fn apply_limit(limit: ResourceLimit, value: u64) -> Result<()> {
    setrlimit(limit.resource(), value as libc::rlim_t, value as libc::rlim_t).map_err(|e| {
        JailError::Privilege(format!("Failed to apply {}={}: {}", limit.name(), value, e))
    })?;
    log::debug!("Applied {}={}", limit.name(), value);
    Ok(())
}
