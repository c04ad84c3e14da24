//! Logging setup shared by the binaries.

pub mod tracing_setup;

pub use tracing_setup::{init_logging, resolve_log_dir};
