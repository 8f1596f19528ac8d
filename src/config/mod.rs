//! Configuration
//!
//! Session configuration types, the error taxonomy, and JSON loading.

pub mod loader;
pub mod types;
