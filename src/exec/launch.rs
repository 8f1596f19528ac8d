/// Target program launch
/// Runs in the forked target right before exec: parent-death signal,
/// AppArmor transition, environment, program lookup, seccomp, execvp.
use crate::config::types::{JailError, ProgramSpec, Result, SoftWarning};
use crate::exec::lookup;
use crate::kernel::privilege::PrivilegeEngine;
use std::ffi::CString;
use std::path::PathBuf;

/// Profile the target switches to on exec when AppArmor is requested
pub const APPARMOR_PROFILE: &str = "rustjail-default";

/// Everything the target needs once the sandbox init has forked it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: ProgramSpec,
    /// Variables set on top of the inherited environment
    pub env: Vec<(String, String)>,
    /// Variables removed from the inherited environment
    pub unset: Vec<String>,
    pub apparmor: bool,
}

impl LaunchPlan {
    pub fn new(program: ProgramSpec) -> Self {
        Self {
            program,
            env: vec![("container".to_string(), "rustjail".to_string())],
            unset: Vec::new(),
            apparmor: false,
        }
    }

    /// Argument vector handed to execvp.
    pub fn argv(&self) -> Vec<String> {
        match &self.program {
            ProgramSpec::Direct { argv } => argv.clone(),
            ProgramSpec::Shell {
                shell,
                command,
                login,
            } => {
                let shell = shell.display().to_string();
                if *login {
                    vec![shell, "-l".to_string()]
                } else {
                    vec![shell, "-c".to_string(), command.clone()]
                }
            }
        }
    }
}

pub fn set_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGKILL).map_err(|e| {
        JailError::Process(format!("Failed to set parent death signal: {}", e))
    })?;
    log::debug!("Parent death signal (SIGKILL) configured");
    Ok(())
}

/// Ask AppArmor to confine the next exec. Best effort.
pub fn change_profile_on_exec(profile: &str) -> Option<SoftWarning> {
    let request = format!("exec {}", profile);
    let attempts = ["/proc/self/attr/apparmor/exec", "/proc/self/attr/exec"];
    let mut last_error = String::from("no AppArmor attribute interface");
    for attr in attempts {
        match std::fs::write(attr, &request) {
            Ok(()) => {
                log::debug!("AppArmor enabled");
                return None;
            }
            Err(e) => last_error = format!("{}: {}", attr, e),
        }
    }
    let warning = SoftWarning::AppArmorUnavailable(format!(
        "cannot confine the application with {} ({})",
        profile, last_error
    ));
    log::warn!("{}", warning);
    Some(warning)
}

fn apply_environment(plan: &LaunchPlan) {
    // Single-threaded at this point: we are the freshly forked target.
    for key in &plan.unset {
        std::env::remove_var(key);
    }
    for (key, value) in &plan.env {
        if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
            log::warn!("Skipping invalid environment entry {:?}", key);
            continue;
        }
        std::env::set_var(key, value);
    }
}

fn to_cstrings(args: &[String]) -> Result<Vec<CString>> {
    args.iter()
        .map(|a| {
            CString::new(a.as_str())
                .map_err(|_| JailError::Config("command contains NUL byte".to_string()))
        })
        .collect()
}

fn resolve_program(plan: &LaunchPlan) -> Result<Option<PathBuf>> {
    match &plan.program {
        ProgramSpec::Direct { argv } => {
            let name = argv
                .first()
                .ok_or_else(|| JailError::Config("no program specified".to_string()))?;
            Ok(Some(lookup::find_in_env_path(name)?))
        }
        ProgramSpec::Shell { .. } => Ok(None),
    }
}

/// Replace the current process with the target.
///
/// Returns only when something went wrong; the error says what.
pub fn exec_program(plan: &LaunchPlan, privileges: &mut PrivilegeEngine) -> JailError {
    match prepare_and_exec(plan, privileges) {
        Ok(never) => match never {},
        Err(e) => e,
    }
}

fn prepare_and_exec(
    plan: &LaunchPlan,
    privileges: &mut PrivilegeEngine,
) -> Result<std::convert::Infallible> {
    set_parent_death_signal()?;
    if plan.apparmor {
        change_profile_on_exec(APPARMOR_PROFILE);
    }
    apply_environment(plan);

    let argv = plan.argv();
    let resolved = resolve_program(plan)?;
    let cargv = to_cstrings(&argv)?;
    let program = match resolved {
        Some(path) => CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| JailError::Config("program path contains NUL byte".to_string()))?,
        None => cargv[0].clone(),
    };

    privileges.load_filters()?;

    log::debug!("execvp {:?}", argv);
    let err = nix::unistd::execvp(&program, &cargv)
        .err()
        .map(|e| JailError::Process(format!("execvp {} failed: {}", argv[0], e)))
        .unwrap_or_else(|| JailError::Process("execvp returned".to_string()));
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_command_runs_through_dash_c() {
        let plan = LaunchPlan::new(ProgramSpec::Shell {
            shell: PathBuf::from("/bin/sh"),
            command: "echo hi".to_string(),
            login: false,
        });
        assert_eq!(plan.argv(), vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn login_shell_ignores_command() {
        let plan = LaunchPlan::new(ProgramSpec::Shell {
            shell: PathBuf::from("/bin/bash"),
            command: String::new(),
            login: true,
        });
        assert_eq!(plan.argv(), vec!["/bin/bash", "-l"]);
    }

    #[test]
    fn direct_argv_is_passed_through() {
        let plan = LaunchPlan::new(ProgramSpec::Direct {
            argv: vec!["ls".to_string(), "-la".to_string()],
        });
        assert_eq!(plan.argv(), vec!["ls", "-la"]);
        assert!(plan
            .env
            .contains(&("container".to_string(), "rustjail".to_string())));
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(to_cstrings(&["a\0b".to_string()]).is_err());
    }
}
