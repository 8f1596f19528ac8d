//! Linux capability bounding-set policy.
//!
//! Resolution is a pure function of (policy, current set), so applying it a
//! second time after a user-namespace reset yields the same set.

mod drop;

pub use drop::{
    drop_bounding_capability, read_bounding_set, read_effective_set, set_no_new_privs,
};

use crate::config::types::{CapabilityPolicy, JailError, Result};
use std::fmt;

/// Capability number newtype for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capability(u32);

const CAP_NAMES: [&str; (Capability::MAX_CAP + 1) as usize] = [
    "chown",
    "dac_override",
    "dac_read_search",
    "fowner",
    "fsetid",
    "kill",
    "setgid",
    "setuid",
    "setpcap",
    "linux_immutable",
    "net_bind_service",
    "net_broadcast",
    "net_admin",
    "net_raw",
    "ipc_lock",
    "ipc_owner",
    "sys_module",
    "sys_rawio",
    "sys_chroot",
    "sys_ptrace",
    "sys_pacct",
    "sys_admin",
    "sys_boot",
    "sys_nice",
    "sys_resource",
    "sys_time",
    "sys_tty_config",
    "mknod",
    "lease",
    "audit_write",
    "audit_control",
    "setfcap",
    "mac_override",
    "mac_admin",
    "syslog",
    "wake_alarm",
    "block_suspend",
    "audit_read",
    "perfmon",
    "bpf",
    "checkpoint_restore",
];

impl Capability {
    pub const MAX_CAP: u32 = 40;

    pub const DAC_OVERRIDE: Capability = Capability(1);
    pub const DAC_READ_SEARCH: Capability = Capability(2);
    pub const SYS_ADMIN: Capability = Capability(21);

    pub fn new(cap: u32) -> Option<Self> {
        if cap <= Self::MAX_CAP {
            Some(Self(cap))
        } else {
            None
        }
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn name(self) -> &'static str {
        CAP_NAMES[self.0 as usize]
    }

    /// Accepts `cap_net_raw`, `CAP_NET_RAW` or `net_raw`.
    pub fn from_name(name: &str) -> Result<Self> {
        let lower = name.trim().to_ascii_lowercase();
        let bare = lower.strip_prefix("cap_").unwrap_or(&lower);
        CAP_NAMES
            .iter()
            .position(|n| *n == bare)
            .map(|idx| Capability(idx as u32))
            .ok_or_else(|| JailError::Config(format!("Unknown capability: {}", name)))
    }

    pub fn all() -> impl Iterator<Item = Capability> {
        (0..=Self::MAX_CAP).map(Capability)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap_{}", self.name())
    }
}

/// Bitmask over capabilities 0..=MAX_CAP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapSet(u64);

impl CapSet {
    pub fn empty() -> Self {
        CapSet(0)
    }

    pub fn full() -> Self {
        CapSet((1u64 << (Capability::MAX_CAP + 1)) - 1)
    }

    pub fn from_bits(bits: u64) -> Self {
        CapSet(bits & Self::full().0)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, cap: Capability) -> bool {
        self.0 & (1u64 << cap.0) != 0
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= 1u64 << cap.0;
    }

    pub fn remove(&mut self, cap: Capability) {
        self.0 &= !(1u64 << cap.0);
    }

    pub fn difference(self, other: CapSet) -> CapSet {
        CapSet(self.0 & !other.0)
    }

    pub fn intersection(self, other: CapSet) -> CapSet {
        CapSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::all().filter(move |cap| self.contains(*cap))
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut set = CapSet::empty();
        for name in names {
            set.insert(Capability::from_name(name.as_ref())?);
        }
        Ok(set)
    }

    /// Format used by the `caps` run file.
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl FromIterator<Capability> for CapSet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapSet::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

/// Capabilities removed by the default filter.
pub fn default_filter() -> CapSet {
    [
        "sys_module",
        "sys_rawio",
        "sys_boot",
        "sys_nice",
        "sys_tty_config",
        "syslog",
        "mknod",
        "sys_admin",
    ]
    .iter()
    .filter_map(|name| Capability::from_name(name).ok())
    .collect()
}

/// Capabilities that bypass discretionary access control.
pub fn dac_bypass() -> CapSet {
    [Capability::DAC_OVERRIDE, Capability::DAC_READ_SEARCH]
        .into_iter()
        .collect()
}

/// Bounding set that results from applying `policy` to `current`.
pub fn resolve(policy: &CapabilityPolicy, current: CapSet) -> Result<CapSet> {
    let target = match policy {
        CapabilityPolicy::None => current,
        CapabilityPolicy::DropAll => CapSet::empty(),
        CapabilityPolicy::DropList(names) => current.difference(CapSet::from_names(names)?),
        CapabilityPolicy::KeepList(names) => {
            return Ok(current.intersection(CapSet::from_names(names)?));
        }
        CapabilityPolicy::DefaultFilter => current.difference(default_filter()),
    };
    Ok(target.difference(dac_bypass()))
}

pub(crate) const PR_CAPBSET_READ: libc::c_int = 23;
pub(crate) const PR_CAPBSET_DROP: libc::c_int = 24;
pub(crate) const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
