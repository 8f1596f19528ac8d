//! Program resolution without a shell, mirroring execvp's PATH search.

use crate::config::types::LookupError;
use nix::unistd::{access, AccessFlags};
use std::path::{Path, PathBuf};

fn executable(path: &Path) -> bool {
    access(path, AccessFlags::X_OK).is_ok()
}

/// Resolve `program` against `path_var`.
///
/// A name containing `/` is checked directly. Otherwise PATH entries are
/// tried left to right and the search stops at the first entry that exists:
/// if that candidate is not executable the lookup fails with
/// `PermissionDenied` instead of falling through to later entries.
pub fn find_program(program: &str, path_var: Option<&str>) -> Result<PathBuf, LookupError> {
    if program.is_empty() {
        return Err(LookupError::NotFound(String::new()));
    }

    if program.contains('/') {
        let path = PathBuf::from(program);
        if executable(&path) {
            return Ok(path);
        }
        if path.exists() {
            return Err(LookupError::PermissionDenied(path));
        }
        return Err(LookupError::NotFound(program.to_string()));
    }

    let Some(path_var) = path_var else {
        return Err(LookupError::NotFound(program.to_string()));
    };
    log::debug!("Searching $PATH for {}", program);

    for dir in path_var.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(program);
        log::trace!("trying {}", candidate.display());
        if std::fs::metadata(&candidate).is_ok() {
            if executable(&candidate) {
                return Ok(candidate);
            }
            log::error!("execute permission denied for {}", candidate.display());
            return Err(LookupError::PermissionDenied(candidate));
        }
    }

    Err(LookupError::NotFound(program.to_string()))
}

/// Lookup against the process environment.
pub fn find_in_env_path(program: &str) -> Result<PathBuf, LookupError> {
    let path_var = std::env::var("PATH").ok();
    find_program(program, path_var.as_deref())
}
