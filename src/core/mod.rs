//! Session core
//!
//! The controller/init split, the supervisor loop run by the sandbox init
//! and the shutdown sequence.

pub mod process_table;
pub mod session;
pub mod shutdown;
pub mod supervisor;
pub mod types;
