//! rustjail: namespace sandbox bootstrap and process supervisor
//!
//! A privileged controller clones a sandbox init into fresh namespaces. The
//! init runs a fixed, irreversible setup sequence, forks the target program
//! and then acts as its init: reaping orphans, following leftover children
//! and enforcing the wall-clock limit.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: clone flags, mount propagation, hostname, id maps
//! - [`kernel::capabilities`]: bounding-set policy and name resolution
//! - [`kernel::seccomp`]: out-of-process filter compilation and BPF loading
//! - [`kernel::privilege`]: ordered privilege reduction and its persisted state
//! - [`kernel::mount`]: filesystem actions of the sandbox init
//! - [`kernel::net`]: interface, route and packet-filter setup
//! - [`kernel::signal`]: async-safe shutdown capture and forwarding
//!
//! ## Execution Control ([`exec`])
//! - [`exec::handshake`]: two-phase controller/init rendezvous
//! - [`exec::bootstrap`]: type-state enforced setup sequence
//! - [`exec::launch`]: final preparation and exec of the target
//!
//! ## Session Core ([`core`](crate::core))
//! - [`core::session`](crate::core::session): controller side and init entry
//! - [`core::supervisor`](crate::core::supervisor): reaping and monitoring loop
//! - [`core::shutdown`](crate::core::shutdown): SIGTERM teardown
//!
//! ## Session State ([`safety`])
//! - [`safety::run_files`]: inspection files under `<run_dir>/mnt`
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: session configuration and error taxonomy
//! - [`config::loader`]: JSON loading and option parsing

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Controller, supervisor and shutdown
pub mod core;

// Session State
pub mod safety;

// Configuration
pub mod config;

// CLI entrypoint wiring for the rustjail binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use crate::core::session::run_sandboxed_session;
