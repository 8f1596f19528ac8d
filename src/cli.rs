use crate::config::loader;
use crate::config::types::{
    CapabilityPolicy, DeviceClass, NetworkMode, PrivateHome, ProgramSpec, SessionConfig,
};
use crate::core::session;
use crate::kernel::affinity;
use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a program in a namespace sandbox", long_about = None)]
pub struct Cli {
    /// Base session configuration (JSON); flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (RUST_LOG still takes precedence)
    #[arg(long)]
    debug: bool,

    /// Kill the sandbox after hh:mm:ss
    #[arg(long, value_name = "hh:mm:ss")]
    timeout: Option<String>,

    /// Shell used to run the command, or "none" to exec it directly
    #[arg(long, value_name = "PATH")]
    shell: Option<String>,

    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    #[arg(long)]
    hostname: Option<String>,

    /// Drop every capability
    #[arg(long)]
    caps_drop_all: bool,

    /// Drop the listed capabilities
    #[arg(long, value_delimiter = ',', value_name = "CAPS")]
    caps_drop: Option<Vec<String>>,

    /// Keep only the listed capabilities
    #[arg(long, value_delimiter = ',', value_name = "CAPS")]
    caps_keep: Option<Vec<String>>,

    /// Drop the default set of dangerous capabilities
    #[arg(long)]
    caps: bool,

    /// Install the default seccomp filter
    #[arg(long)]
    seccomp: bool,

    /// Syscalls added to the default seccomp drop list
    #[arg(long, value_delimiter = ',', value_name = "SYSCALLS")]
    seccomp_add: Option<Vec<String>>,

    #[arg(long, value_delimiter = ',', value_name = "SYSCALLS")]
    seccomp_drop: Option<Vec<String>>,

    #[arg(long, value_delimiter = ',', value_name = "SYSCALLS")]
    seccomp_keep: Option<Vec<String>>,

    /// Allowed socket protocols, e.g. unix,inet,inet6
    #[arg(long, value_name = "LIST")]
    protocol: Option<String>,

    #[arg(long)]
    memory_deny_write_execute: bool,

    #[arg(long, value_name = "N")]
    rlimit_nofile: Option<u64>,

    #[arg(long, value_name = "N")]
    rlimit_nproc: Option<u64>,

    #[arg(long, value_name = "BYTES")]
    rlimit_fsize: Option<u64>,

    #[arg(long, value_name = "N")]
    rlimit_sigpending: Option<u64>,

    #[arg(long = "rlimit-as", value_name = "BYTES")]
    rlimit_address_space: Option<u64>,

    #[arg(long, allow_hyphen_values = true)]
    nice: Option<i32>,

    /// CPU affinity list, e.g. 0,2-3
    #[arg(long, value_name = "CPUS", value_parser = parse_cpus)]
    cpu: Option<CpuList>,

    #[arg(long, value_name = "PATH")]
    cgroup: Option<PathBuf>,

    /// Strict capability and filter policy regardless of other flags
    #[arg(long)]
    enforce_confinement: bool,

    /// Map only the invoking user in a new user namespace
    #[arg(long)]
    noroot: bool,

    #[arg(long)]
    nonewprivs: bool,

    #[arg(long)]
    nogroups: bool,

    /// Private network namespace with loopback only
    #[arg(long, conflicts_with = "netns")]
    net_none: bool,

    /// Join a named network namespace
    #[arg(long, value_name = "NAME")]
    netns: Option<String>,

    #[arg(long, value_name = "ADDRESS")]
    dns: Vec<IpAddr>,

    #[arg(long, value_name = "ADDRESS")]
    defaultgw: Option<Ipv4Addr>,

    /// Install the client packet filter, or the given iptables-restore file
    #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "")]
    netfilter: Option<String>,

    /// Empty private home
    #[arg(long)]
    private: bool,

    /// Host directory mounted as home
    #[arg(long, value_name = "DIR", conflicts_with = "private")]
    private_home: Option<PathBuf>,

    /// Empty home keeping the listed entries
    #[arg(long, value_delimiter = ',', value_name = "FILES")]
    private_keep: Option<Vec<String>>,

    #[arg(long)]
    private_dev: bool,

    #[arg(long, value_delimiter = ',', value_name = "FILES")]
    private_etc: Option<Vec<String>>,

    #[arg(long, value_delimiter = ',', value_name = "FILES")]
    private_opt: Option<Vec<String>>,

    #[arg(long, value_delimiter = ',', value_name = "FILES")]
    private_srv: Option<Vec<String>>,

    #[arg(long)]
    private_tmp: bool,

    /// Disable the D-Bus session bus
    #[arg(long)]
    nodbus: bool,

    #[arg(long)]
    disable_mnt: bool,

    #[arg(long, value_name = "FILE")]
    hosts_file: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    whitelist: Vec<PathBuf>,

    #[arg(long, value_name = "PATH")]
    blacklist: Vec<PathBuf>,

    #[arg(long)]
    nosound: bool,

    #[arg(long)]
    no3d: bool,

    #[arg(long)]
    notv: bool,

    #[arg(long)]
    nodvd: bool,

    #[arg(long)]
    novideo: bool,

    /// Environment variable for the target
    #[arg(long, value_name = "NAME=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    #[arg(long)]
    apparmor: bool,

    /// Log library calls of the target
    #[arg(long)]
    trace: bool,

    /// Log denied filesystem access
    #[arg(long)]
    tracelog: bool,

    #[arg(long, value_name = "DIR")]
    run_dir: Option<PathBuf>,

    /// Seccomp compiler helper
    #[arg(long, value_name = "PATH")]
    filter_helper: Option<PathBuf>,

    /// Program and arguments; a login shell when empty
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn parse_env(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, val)) if !name.is_empty() => Ok((name.to_string(), val.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {:?}", value)),
    }
}

/// Parsed `--cpu` value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuList(Vec<usize>);

fn parse_cpus(value: &str) -> std::result::Result<CpuList, String> {
    affinity::parse_cpu_list(value)
        .map(CpuList)
        .map_err(|e| e.to_string())
}

fn has_command(program: &ProgramSpec) -> bool {
    match program {
        ProgramSpec::Direct { argv } => argv.first().is_some_and(|a| !a.is_empty()),
        ProgramSpec::Shell { command, login, .. } => *login || !command.trim().is_empty(),
    }
}

impl Cli {
    /// Build the session configuration: file values first, flags on top.
    pub fn into_config(self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => loader::load_from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SessionConfig::default(),
        };

        self.apply_program(&mut config);

        if let Some(timeout) = &self.timeout {
            config.timeout = Some(loader::parse_timeout(timeout)?);
        }
        if self.cwd.is_some() {
            config.cwd = self.cwd.clone();
        }
        if self.hostname.is_some() {
            config.hostname = self.hostname.clone();
        }

        if let Some(keep) = &self.caps_keep {
            config.capabilities = CapabilityPolicy::KeepList(keep.clone());
        } else if let Some(drop) = &self.caps_drop {
            config.capabilities = CapabilityPolicy::DropList(drop.clone());
        } else if self.caps_drop_all {
            config.capabilities = CapabilityPolicy::DropAll;
        } else if self.caps {
            config.capabilities = CapabilityPolicy::DefaultFilter;
        }

        let seccomp = &mut config.seccomp;
        if self.seccomp || self.seccomp_add.is_some() {
            seccomp.enabled = true;
        }
        if let Some(extra) = &self.seccomp_add {
            seccomp.extra = extra.clone();
        }
        if self.seccomp_drop.is_some() {
            seccomp.drop = self.seccomp_drop.clone();
        }
        if self.seccomp_keep.is_some() {
            seccomp.keep = self.seccomp_keep.clone();
        }
        if self.protocol.is_some() {
            seccomp.protocol = self.protocol.clone();
        }
        seccomp.memory_deny_write_execute |= self.memory_deny_write_execute;

        let limits = &mut config.limits;
        limits.nofile = self.rlimit_nofile.or(limits.nofile);
        limits.nproc = self.rlimit_nproc.or(limits.nproc);
        limits.fsize = self.rlimit_fsize.or(limits.fsize);
        limits.sigpending = self.rlimit_sigpending.or(limits.sigpending);
        limits.address_space = self.rlimit_address_space.or(limits.address_space);

        config.nice = self.nice.or(config.nice);
        if let Some(CpuList(cpus)) = &self.cpu {
            config.cpus = cpus.clone();
        }
        if self.cgroup.is_some() {
            config.cgroup = self.cgroup.clone();
        }

        config.enforce_confinement |= self.enforce_confinement;
        config.noroot |= self.noroot;
        config.no_new_privs |= self.nonewprivs;
        config.drop_groups |= self.nogroups;

        self.apply_network(&mut config);
        self.apply_filesystem(&mut config);

        let denied = [
            (self.nosound, DeviceClass::Sound),
            (self.no3d, DeviceClass::ThreeD),
            (self.notv, DeviceClass::Tv),
            (self.nodvd, DeviceClass::Dvd),
            (self.novideo, DeviceClass::Video),
        ];
        for (flag, class) in denied {
            if flag && !config.deny_devices.contains(&class) {
                config.deny_devices.push(class);
            }
        }

        config.env.extend(self.env.iter().cloned());
        config.apparmor |= self.apparmor;
        config.trace.trace |= self.trace;
        config.trace.trace_log |= self.tracelog;
        if let Some(dir) = &self.run_dir {
            config.run_dir = dir.clone();
        }
        if let Some(helper) = &self.filter_helper {
            config.filter_helper = helper.clone();
        }

        Ok(config)
    }

    fn apply_program(&self, config: &mut SessionConfig) {
        let shell = match self.shell.as_deref() {
            Some("none") => None,
            Some(path) => Some(PathBuf::from(path)),
            None => Some(match &config.program {
                ProgramSpec::Shell { shell, .. } => shell.clone(),
                ProgramSpec::Direct { .. } => PathBuf::from("/bin/sh"),
            }),
        };

        if self.command.is_empty() {
            if self.config.is_some() && has_command(&config.program) {
                return;
            }
            let shell = shell.unwrap_or_else(|| PathBuf::from("/bin/sh"));
            config.program = ProgramSpec::Shell {
                shell,
                command: String::new(),
                login: true,
            };
            return;
        }

        config.program = match shell {
            Some(shell) => ProgramSpec::Shell {
                shell,
                command: self.command.join(" "),
                login: false,
            },
            None => ProgramSpec::Direct {
                argv: self.command.clone(),
            },
        };
    }

    fn apply_network(&self, config: &mut SessionConfig) {
        let network = &mut config.network;
        if self.net_none {
            network.mode = NetworkMode::None;
        } else if let Some(name) = &self.netns {
            network.mode = NetworkMode::Namespace(name.clone());
        }
        network.dns.extend(self.dns.iter().copied());
        if self.defaultgw.is_some() {
            network.default_gateway = self.defaultgw;
        }
        if let Some(file) = &self.netfilter {
            network.enable_netfilter = true;
            if !file.is_empty() {
                network.netfilter = Some(PathBuf::from(file));
            }
        }
    }

    fn apply_filesystem(&self, config: &mut SessionConfig) {
        let fs = &mut config.filesystem;
        if let Some(dir) = &self.private_home {
            fs.private_home = PrivateHome::Directory(dir.clone());
        } else if let Some(keep) = &self.private_keep {
            fs.private_home = PrivateHome::Keep(keep.clone());
        } else if self.private {
            fs.private_home = PrivateHome::Empty;
        }
        fs.private_dev |= self.private_dev;
        if self.private_etc.is_some() {
            fs.private_etc = self.private_etc.clone();
        }
        if self.private_opt.is_some() {
            fs.private_opt = self.private_opt.clone();
        }
        if self.private_srv.is_some() {
            fs.private_srv = self.private_srv.clone();
        }
        fs.private_tmp |= self.private_tmp;
        fs.disable_session_bus |= self.nodbus;
        fs.disable_mnt |= self.disable_mnt;
        if self.hosts_file.is_some() {
            fs.hosts_file = self.hosts_file.clone();
        }
        fs.whitelist.extend(self.whitelist.iter().cloned());
        fs.blacklist.extend(self.blacklist.iter().cloned());
        fs.no_audio_server |= self.nosound;
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

/// Parse arguments, run the session and return its exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if !nix::unistd::geteuid().is_root() {
        eprintln!("Warning: rustjail needs root privileges to create namespaces and mounts");
    }

    let config = cli.into_config()?;
    log::debug!("Session configuration: {:?}", config);

    let code = session::run_sandboxed_session(config).context("sandbox session failed")?;
    log::info!("Parent is shutting down, bye...");
    Ok(code)
}
