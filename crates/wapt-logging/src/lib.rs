//! Logging bootstrap shared by the `wapt` binaries.
//!
//! Installs a `tracing` registry that writes compact lines to stderr and a
//! set of daily-rolling files under `<root>/logs`, one per subsystem target.

pub mod config;
pub mod fs;
pub mod init;
pub mod retention;
pub mod targets;

pub use config::LoggingConfig;
pub use fs::{read_config, write_config_atomic};
pub use init::{apply, init, LoggingGuards};
pub use retention::run_retention;
