//! UID/GID transitions for privilege dropping.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid.

mod transition;
mod validation;

pub use transition::drop_privileges;
pub use validation::{plan_transition, TransitionPlan};
