//! Miru - extension host
//!
//! Application layer over `miru_js_runtime`:
//! - Configuration file and command-line overrides
//! - Logging setup
//! - Long-running mode with hot reload, and one-shot queries

// Re-export the runtime crate
pub use miru_js_runtime;

pub mod cli;
pub mod config;
pub mod logging;
