//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> namespace -> capabilities -> seccomp -> privilege -> credentials

pub mod affinity;
pub mod capabilities;
pub mod credentials;
pub mod mount;
pub mod namespace;
pub mod net;
pub mod privilege;
pub mod rlimits;
pub mod seccomp;
pub mod signal;
