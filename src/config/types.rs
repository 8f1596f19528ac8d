/// Core types and structures for rustjail sessions
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Default location of the per-session runtime directory.
pub const DEFAULT_RUN_DIR: &str = "/run/rustjail";

/// Default privilege-minimized seccomp compiler helper.
pub const DEFAULT_FILTER_HELPER: &str = "/usr/lib/rustjail/fseccomp";

/// Default tracing/preload shim library.
pub const DEFAULT_PRELOAD_LIBRARY: &str = "/usr/lib/rustjail/libtrace.so";

/// Exit code reported when the target was killed or stopped abnormally.
pub const ABNORMAL_EXIT: i32 = -1;

/// User and group identity the sandboxed program runs as
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Real ids of the invoking user. When started through sudo the
    /// `SUDO_UID`/`SUDO_GID` pair identifies the user instead of root.
    pub fn invoking_user() -> Self {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        if uid != 0 {
            return Self { uid, gid };
        }

        let sudo_uid = std::env::var("SUDO_UID").ok().and_then(|v| v.parse().ok());
        let sudo_gid = std::env::var("SUDO_GID").ok().and_then(|v| v.parse().ok());
        if let (Some(uid), Some(gid)) = (sudo_uid, sudo_gid) {
            return Self { uid, gid };
        }
        Self { uid, gid }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// How the target program is started
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramSpec {
    /// argv[0] is looked up on PATH
    Direct { argv: Vec<String> },
    /// Command line handed to a shell with `-c`
    Shell {
        shell: PathBuf,
        command: String,
        #[serde(default)]
        login: bool,
    },
}

impl ProgramSpec {
    /// Basename of the program that will actually run inside the sandbox.
    pub fn command_name(&self) -> String {
        let raw = match self {
            ProgramSpec::Direct { argv } => argv.first().map(String::as_str).unwrap_or(""),
            ProgramSpec::Shell { command, .. } => command.split_whitespace().next().unwrap_or(""),
        };
        raw.rsplit('/').next().unwrap_or(raw).to_string()
    }
}

/// Capability policy; exactly one mode is active
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityPolicy {
    #[default]
    None,
    DropAll,
    DropList(Vec<String>),
    KeepList(Vec<String>),
    DefaultFilter,
}

/// Seccomp configuration as requested by the caller
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeccompPolicy {
    /// Install the general filter
    pub enabled: bool,
    /// Syscalls added to the default drop list
    pub extra: Vec<String>,
    /// Replace the default drop list
    pub drop: Option<Vec<String>>,
    /// Allow only these syscalls; wins over `drop`
    pub keep: Option<Vec<String>>,
    /// Socket protocol filter spec, e.g. "unix,inet,inet6"
    pub protocol: Option<String>,
    pub memory_deny_write_execute: bool,
}

/// Resource limits applied once before the target is forked
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub nofile: Option<u64>,
    pub nproc: Option<u64>,
    pub fsize: Option<u64>,
    pub sigpending: Option<u64>,
    pub address_space: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.nofile.is_none()
            && self.nproc.is_none()
            && self.fsize.is_none()
            && self.sigpending.is_none()
            && self.address_space.is_none()
    }
}

/// Private home directory mode
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivateHome {
    #[default]
    Disabled,
    /// Empty tmpfs home
    Empty,
    /// Host directory mounted as home
    Directory(PathBuf),
    /// Empty home keeping the listed entries
    Keep(Vec<String>),
}

/// Filesystem setup options forwarded to the filesystem engine
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemOptions {
    pub private_home: PrivateHome,
    pub private_dev: bool,
    pub private_etc: Option<Vec<String>>,
    pub private_opt: Option<Vec<String>>,
    pub private_srv: Option<Vec<String>>,
    pub private_tmp: bool,
    pub disable_session_bus: bool,
    pub disable_mnt: bool,
    pub hosts_file: Option<PathBuf>,
    pub whitelist: Vec<PathBuf>,
    pub blacklist: Vec<PathBuf>,
    /// Skip the audio server client configuration
    pub no_audio_server: bool,
}

/// Device classes that can be denied inside the sandbox
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Sound,
    ThreeD,
    Tv,
    Dvd,
    Video,
}

impl FromStr for DeviceClass {
    type Err = JailError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sound" => Ok(DeviceClass::Sound),
            "3d" => Ok(DeviceClass::ThreeD),
            "tv" => Ok(DeviceClass::Tv),
            "dvd" => Ok(DeviceClass::Dvd),
            "video" => Ok(DeviceClass::Video),
            other => Err(JailError::Config(format!("Unknown device class: {}", other))),
        }
    }
}

/// Tracing shim options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceOptions {
    pub trace: bool,
    pub trace_log: bool,
    pub preload_library: PathBuf,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            trace: false,
            trace_log: false,
            preload_library: PathBuf::from(DEFAULT_PRELOAD_LIBRARY),
        }
    }
}

/// Hardware address of a sandbox interface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = JailError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(JailError::Config(format!("Invalid MAC address: {}", s)));
        }
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| JailError::Config(format!("Invalid MAC address: {}", s)))?;
        }
        Ok(MacAddr(bytes))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// One bridge/macvlan attachment of the sandbox
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Host bridge or parent device
    pub host_device: String,
    /// Interface name inside the sandbox
    pub sandbox_device: String,
    /// Address of the host side of the bridge
    pub host_ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// Requested sandbox address; negotiated over ARP when absent
    #[serde(default)]
    pub sandbox_ip: Option<Ipv4Addr>,
    /// Bring the interface up without an address
    #[serde(default)]
    pub no_ip: bool,
    #[serde(default)]
    pub macvlan: bool,
    #[serde(default)]
    pub mac: Option<MacAddr>,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub ipv6: Option<String>,
}

/// Host interface moved into the sandbox namespace
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub device: String,
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
    #[serde(default)]
    pub mask: Option<Ipv4Addr>,
    #[serde(default)]
    pub mtu: Option<u32>,
}

/// Network namespace mode
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Share the host network stack
    #[default]
    Host,
    /// Private namespace with loopback only
    None,
    /// Join a named network namespace
    Namespace(String),
    /// Private namespace wired through bridges and/or moved interfaces
    Bridged,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    pub bridges: Vec<BridgeConfig>,
    pub interfaces: Vec<InterfaceConfig>,
    pub default_gateway: Option<Ipv4Addr>,
    pub dns: Vec<IpAddr>,
    /// iptables-restore rules; built-in client filter when absent
    pub netfilter: Option<PathBuf>,
    pub netfilter6: Option<PathBuf>,
    /// Build packet filters
    pub enable_netfilter: bool,
}

impl NetworkConfig {
    /// Whether the sandbox init needs a fresh network namespace at clone time.
    pub fn needs_namespace(&self) -> bool {
        matches!(self.mode, NetworkMode::None | NetworkMode::Bridged)
    }

    pub fn any_bridge(&self) -> bool {
        !self.bridges.is_empty()
    }
}

/// Immutable description of one sandboxed session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub program: ProgramSpec,
    pub cwd: Option<PathBuf>,
    pub home: PathBuf,
    pub user: Credentials,
    pub hostname: Option<String>,
    pub capabilities: CapabilityPolicy,
    pub seccomp: SeccompPolicy,
    pub limits: ResourceLimits,
    pub nice: Option<i32>,
    pub cpus: Vec<usize>,
    pub cgroup: Option<PathBuf>,
    /// Wall-clock limit in seconds
    pub timeout: Option<u64>,
    /// Force the strictest filter/capability policy
    pub enforce_confinement: bool,
    /// Create a user namespace mapping only the invoking user
    pub noroot: bool,
    pub no_new_privs: bool,
    /// Drop supplementary groups
    pub drop_groups: bool,
    pub network: NetworkConfig,
    pub filesystem: FilesystemOptions,
    pub deny_devices: Vec<DeviceClass>,
    pub env: Vec<(String, String)>,
    pub apparmor: bool,
    pub trace: TraceOptions,
    pub run_dir: PathBuf,
    pub filter_helper: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: ProgramSpec::Shell {
                shell: PathBuf::from("/bin/sh"),
                command: String::new(),
                login: false,
            },
            cwd: None,
            home: std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/")),
            user: Credentials::invoking_user(),
            hostname: None,
            capabilities: CapabilityPolicy::None,
            seccomp: SeccompPolicy::default(),
            limits: ResourceLimits::default(),
            nice: None,
            cpus: Vec::new(),
            cgroup: None,
            timeout: None,
            enforce_confinement: false,
            noroot: false,
            no_new_privs: false,
            drop_groups: false,
            network: NetworkConfig::default(),
            filesystem: FilesystemOptions::default(),
            deny_devices: Vec::new(),
            env: Vec::new(),
            apparmor: false,
            trace: TraceOptions::default(),
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            filter_helper: PathBuf::from(DEFAULT_FILTER_HELPER),
        }
    }
}

impl SessionConfig {
    /// Reject configurations that cannot start a session at all.
    pub fn validate(&self) -> Result<()> {
        match &self.program {
            ProgramSpec::Direct { argv } if argv.is_empty() || argv[0].is_empty() => {
                return Err(JailError::Config("empty command".to_string()));
            }
            ProgramSpec::Shell {
                command,
                login: false,
                ..
            } if command.trim().is_empty() => {
                return Err(JailError::Config("empty shell command".to_string()));
            }
            _ => {}
        }

        if self.network.bridges.len() > 4 {
            return Err(JailError::Config(
                "at most 4 bridge attachments are supported".to_string(),
            ));
        }

        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() || hostname.len() > 64 {
                return Err(JailError::Config(format!("Invalid hostname: {:?}", hostname)));
            }
        }

        if self.seccomp.keep.is_some() && self.seccomp.drop.is_some() {
            log::warn!("Both seccomp keep and drop lists configured; the keep list wins");
        }

        Ok(())
    }

    pub fn run_mnt_dir(&self) -> PathBuf {
        self.run_dir.join("mnt")
    }
}

/// Degraded-guarantee events that do not stop the bootstrap
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoftWarning {
    UserNamespaceDenied(String),
    NoNewPrivsUnsupported(String),
    DefaultRouteFailed(String),
    NiceFailed(String),
    AppArmorUnavailable(String),
}

impl fmt::Display for SoftWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SoftWarning::UserNamespaceDenied(e) => {
                write!(f, "cannot create a new user namespace: {}", e)
            }
            SoftWarning::NoNewPrivsUnsupported(e) => {
                write!(f, "NO_NEW_PRIVS not supported by this kernel: {}", e)
            }
            SoftWarning::DefaultRouteFailed(e) => {
                write!(f, "cannot configure default route: {}", e)
            }
            SoftWarning::NiceFailed(e) => write!(f, "cannot set nice value: {}", e),
            SoftWarning::AppArmorUnavailable(e) => {
                write!(f, "cannot confine the application using AppArmor: {}", e)
            }
        }
    }
}

/// Error taxonomy used for exit-code and logging decisions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    FatalSetup,
    Protocol,
}

/// Program lookup failures
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("program {0} not found")]
    NotFound(String),

    #[error("permission denied executing {}", .0.display())]
    PermissionDenied(PathBuf),
}

/// Custom error types for rustjail
#[derive(Error, Debug)]
pub enum JailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Handshake error: {0}")]
    Protocol(String),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Helper {helper} exited with status {status}")]
    Helper { helper: String, status: i32 },
}

impl JailError {
    pub fn class(&self) -> ErrorClass {
        match self {
            JailError::Protocol(_) => ErrorClass::Protocol,
            _ => ErrorClass::FatalSetup,
        }
    }

    /// Exit status of the sandbox init when bootstrap stops on this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            JailError::Helper { status, .. } if *status != 0 => *status,
            _ => 1,
        }
    }
}

impl From<nix::errno::Errno> for JailError {
    fn from(err: nix::errno::Errno) -> Self {
        JailError::Process(err.to_string())
    }
}

/// Result type alias for rustjail operations
pub type Result<T> = std::result::Result<T, JailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_name_strips_directories() {
        let direct = ProgramSpec::Direct {
            argv: vec!["/usr/bin/dillo".to_string(), "-f".to_string()],
        };
        assert_eq!(direct.command_name(), "dillo");

        let shell = ProgramSpec::Shell {
            shell: PathBuf::from("/bin/sh"),
            command: "firefox --private".to_string(),
            login: false,
        };
        assert_eq!(shell.command_name(), "firefox");
    }

    #[test]
    fn empty_command_is_rejected() {
        let config = SessionConfig {
            program: ProgramSpec::Direct { argv: vec![] },
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(JailError::Config(_))));
    }

    #[test]
    fn too_many_bridges_are_rejected() {
        let bridge = BridgeConfig {
            host_device: "br0".to_string(),
            sandbox_device: "eth0".to_string(),
            host_ip: Ipv4Addr::new(10, 10, 20, 1),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            sandbox_ip: None,
            no_ip: false,
            macvlan: false,
            mac: None,
            mtu: None,
            ipv6: None,
        };
        let mut config = SessionConfig {
            program: ProgramSpec::Direct { argv: vec!["true".to_string()] },
            ..SessionConfig::default()
        };
        config.network.bridges = vec![bridge; 5];
        assert!(config.validate().is_err());
    }

    #[test]
    fn mac_address_parses_and_formats() {
        let mac: MacAddr = "02:42:ac:11:00:02".parse().unwrap();
        assert_eq!(mac.0, [0x02, 0x42, 0xac, 0x11, 0x00, 0x02]);
        assert_eq!(mac.to_string(), "02:42:ac:11:00:02");
        assert!("02:42:ac".parse::<MacAddr>().is_err());
        assert!("zz:42:ac:11:00:02".parse::<MacAddr>().is_err());
    }

    #[test]
    fn protocol_errors_are_classified_separately() {
        assert_eq!(
            JailError::Protocol("eof".to_string()).class(),
            ErrorClass::Protocol
        );
        assert_eq!(
            JailError::Mount("slave".to_string()).class(),
            ErrorClass::FatalSetup
        );
    }

    #[test]
    fn helper_status_becomes_exit_code() {
        let err = JailError::Helper {
            helper: "fseccomp".to_string(),
            status: 3,
        };
        assert_eq!(err.exit_code(), 3);
        assert_eq!(JailError::Config("x".to_string()).exit_code(), 1);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = SessionConfig {
            program: ProgramSpec::Direct { argv: vec!["ls".to_string()] },
            capabilities: CapabilityPolicy::KeepList(vec!["cap_net_raw".to_string()]),
            timeout: Some(90),
            ..SessionConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
