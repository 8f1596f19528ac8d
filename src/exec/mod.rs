//! Execution control
//!
//! Orchestrates kernel primitives into the sandbox bootstrap with type-state
//! enforcement, then hands over to the target program.

pub mod bootstrap;
pub mod handshake;
pub mod launch;
pub mod lookup;
