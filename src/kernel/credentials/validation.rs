//! Credential validation logic.

use crate::config::types::{Credentials, JailError, Result};

/// What the final credential drop has to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    /// The sandbox runs as root; ids stay as they are
    KeepRoot,
    /// Switch to the given unprivileged ids
    Drop(Credentials),
}

/// Reject half-root identities; a root target means a root sandbox.
pub fn plan_transition(target: Credentials) -> Result<TransitionPlan> {
    match (target.uid == 0, target.gid == 0) {
        (true, true) => Ok(TransitionPlan::KeepRoot),
        (false, false) => Ok(TransitionPlan::Drop(target)),
        _ => Err(JailError::Privilege(format!(
            "Refusing mixed root/non-root credentials (uid={}, gid={})",
            target.uid, target.gid
        ))),
    }
}
