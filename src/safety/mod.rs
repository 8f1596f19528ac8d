//! Session state
//!
//! Recovery and inspection files kept in the session work area.

pub mod run_files;
