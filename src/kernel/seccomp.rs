// Seccomp filter staging and loading.
// Filters are compiled out of process into BPF files under the run
// directory, then installed right before the target program is executed.

use crate::config::types::{Credentials, JailError, Result, SeccompPolicy};
use serde::{Deserialize, Serialize};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

const PR_SET_SECCOMP: libc::c_int = 22;
const SECCOMP_MODE_FILTER: libc::c_ulong = 2;
/// Kernel limit on instructions per filter
const BPF_MAXINSNS: usize = 4096;
const SOCK_FILTER_SIZE: usize = 8;

const KNOWN_PROTOCOLS: [&str; 6] = ["unix", "inet", "inet6", "netlink", "packet", "bluetooth"];

/// General filter class; at most one is active per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeneralFilterClass {
    Default,
    Drop,
    Keep,
}

/// General syscall filter as resolved from the seccomp policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneralFilter {
    /// Built-in drop list, optionally extended
    Default { extra: Vec<String> },
    /// Caller-supplied drop list replacing the built-in one
    Drop(Vec<String>),
    /// Allow list
    Keep(Vec<String>),
}

impl GeneralFilter {
    /// Keep wins over drop; nothing is installed unless the filter is enabled.
    pub fn from_policy(policy: &SeccompPolicy) -> Option<Self> {
        if !policy.enabled {
            return None;
        }
        if let Some(keep) = &policy.keep {
            return Some(GeneralFilter::Keep(keep.clone()));
        }
        if let Some(drop) = &policy.drop {
            return Some(GeneralFilter::Drop(drop.clone()));
        }
        Some(GeneralFilter::Default {
            extra: policy.extra.clone(),
        })
    }

    pub fn class(&self) -> GeneralFilterClass {
        match self {
            GeneralFilter::Default { .. } => GeneralFilterClass::Default,
            GeneralFilter::Drop(_) => GeneralFilterClass::Drop,
            GeneralFilter::Keep(_) => GeneralFilterClass::Keep,
        }
    }

    /// Custom lists are also enforced after exec by the preload shim.
    pub fn needs_postexec(&self) -> bool {
        match self {
            GeneralFilter::Default { extra } => !extra.is_empty(),
            GeneralFilter::Drop(_) | GeneralFilter::Keep(_) => true,
        }
    }
}

/// One filter file, in load order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterStage {
    Protocol,
    General(GeneralFilterClass),
    MemoryDenyWriteExecute,
}

impl FilterStage {
    pub fn file_name(&self) -> &'static str {
        match self {
            FilterStage::Protocol => "seccomp.protocol",
            FilterStage::General(_) => "seccomp.general",
            FilterStage::MemoryDenyWriteExecute => "seccomp.mdwx",
        }
    }
}

/// Reject protocol specs the filter helper would not understand.
pub fn validate_protocol_spec(spec: &str) -> Result<()> {
    if spec.trim().is_empty() {
        return Err(JailError::Config("empty protocol list".to_string()));
    }
    for proto in spec.split(',') {
        if !KNOWN_PROTOCOLS.contains(&proto.trim()) {
            return Err(JailError::Config(format!("Unknown protocol: {}", proto)));
        }
    }
    Ok(())
}

/// Out-of-process filter compiler
pub trait FilterCompiler {
    fn compile_protocol(&mut self, spec: &str, out: &Path) -> Result<()>;
    fn compile_general(&mut self, filter: &GeneralFilter, out: &Path) -> Result<()>;
    fn compile_memory_deny_write_execute(&mut self, out: &Path) -> Result<()>;
}

/// Runs the filter helper as the invoking user with no capabilities and
/// no-new-privileges set.
pub struct HelperCompiler {
    helper: PathBuf,
    user: Credentials,
}

impl HelperCompiler {
    pub fn new(helper: impl Into<PathBuf>, user: Credentials) -> Self {
        Self {
            helper: helper.into(),
            user,
        }
    }

    fn run(&self, args: &[String]) -> Result<()> {
        log::debug!("Running {} {}", self.helper.display(), args.join(" "));

        let mut command = Command::new(&self.helper);
        command.args(args).env_clear();
        if nix::unistd::geteuid().is_root() {
            command.uid(self.user.uid).gid(self.user.gid);
        }
        // SAFETY: the hook only calls prctl, which is async-signal-safe.
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let status = command.status().map_err(|e| {
            JailError::Seccomp(format!("cannot run {}: {}", self.helper.display(), e))
        })?;
        if !status.success() {
            return Err(JailError::Helper {
                helper: self.helper.display().to_string(),
                status: status.code().unwrap_or(1),
            });
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

impl FilterCompiler for HelperCompiler {
    fn compile_protocol(&mut self, spec: &str, out: &Path) -> Result<()> {
        validate_protocol_spec(spec)?;
        self.run(&[
            "protocol".to_string(),
            "build".to_string(),
            spec.to_string(),
            path_arg(out),
        ])
    }

    fn compile_general(&mut self, filter: &GeneralFilter, out: &Path) -> Result<()> {
        let args = match filter {
            GeneralFilter::Default { extra } if extra.is_empty() => {
                vec!["default".to_string(), path_arg(out)]
            }
            GeneralFilter::Default { extra } => vec![
                "default".to_string(),
                "drop".to_string(),
                path_arg(out),
                extra.join(","),
            ],
            GeneralFilter::Drop(list) => vec!["drop".to_string(), path_arg(out), list.join(",")],
            GeneralFilter::Keep(list) => vec!["keep".to_string(), path_arg(out), list.join(",")],
        };
        self.run(&args)
    }

    fn compile_memory_deny_write_execute(&mut self, out: &Path) -> Result<()> {
        self.run(&["memory-deny-write-execute".to_string(), path_arg(out)])
    }
}

/// Decode a compiled BPF program (array of 8-byte `sock_filter`, native endian).
pub fn parse_bpf_program(bytes: &[u8]) -> Result<Vec<libc::sock_filter>> {
    if bytes.is_empty() || bytes.len() % SOCK_FILTER_SIZE != 0 {
        return Err(JailError::Seccomp(format!(
            "invalid BPF program size {}",
            bytes.len()
        )));
    }
    let count = bytes.len() / SOCK_FILTER_SIZE;
    if count > BPF_MAXINSNS {
        return Err(JailError::Seccomp(format!(
            "BPF program too long ({} instructions)",
            count
        )));
    }

    let program = bytes
        .chunks_exact(SOCK_FILTER_SIZE)
        .map(|c| libc::sock_filter {
            code: u16::from_ne_bytes([c[0], c[1]]),
            jt: c[2],
            jf: c[3],
            k: u32::from_ne_bytes([c[4], c[5], c[6], c[7]]),
        })
        .collect();
    Ok(program)
}

/// Install one compiled filter file into the calling thread.
pub fn load_filter_file(path: &Path) -> Result<()> {
    let bytes = std::fs::read(path)
        .map_err(|e| JailError::Seccomp(format!("cannot read {}: {}", path.display(), e)))?;
    let mut program = parse_bpf_program(&bytes)?;

    let fprog = libc::sock_fprog {
        len: program.len() as libc::c_ushort,
        filter: program.as_mut_ptr(),
    };
    // SAFETY: fprog points at `program`, which outlives the call; the kernel
    // copies the instructions before returning.
    let rc = unsafe {
        libc::prctl(
            PR_SET_SECCOMP,
            SECCOMP_MODE_FILTER,
            &fprog as *const libc::sock_fprog,
        )
    };
    if rc != 0 {
        return Err(JailError::Seccomp(format!(
            "cannot load {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    log::debug!("Loaded seccomp filter {}", path.display());
    Ok(())
}
