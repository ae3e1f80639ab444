use thiserror::Error;

/// Error type for every operation in the core.
///
/// The first five variants are the failure classes the pipelines report to
/// an operator; the rest describe the underlying cause of a failed step.
#[derive(Error, Debug)]
pub enum WaptError {
    #[error("Invalid profile: {0}")]
    Validation(String),

    #[error("An access point is already running ({ssid}, channel {channel}). Stop it before starting another.")]
    SessionActive { ssid: String, channel: String },

    #[error("Interface '{interface}' did not become {desired} after {attempts} checks")]
    InterfaceTimeout {
        interface: String,
        desired: String,
        attempts: u32,
    },

    #[error("Driver reset failed for '{interface}': {reason}. Operator intervention required.")]
    DriverReset { interface: String, reason: String },

    #[error("{daemon} failed to start: {reason}")]
    DaemonStart { daemon: String, reason: String },

    #[error("Refusing to {action} on '{interface}' while it is administratively up")]
    IllegalTransition { interface: String, action: String },

    #[error("Firewall rule `{rule}` was rejected: {reason}")]
    Firewall { rule: String, reason: String },

    #[error("`{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("IO error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WaptError>;

impl WaptError {
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            reason: reason.into(),
        }
    }

    pub fn daemon_start(daemon: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DaemonStart {
            daemon: daemon.into(),
            reason: reason.into(),
        }
    }

    pub fn driver_reset(interface: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DriverReset {
            interface: interface.into(),
            reason: reason.into(),
        }
    }

    /// True for failures that leave the host needing manual attention.
    pub fn requires_operator(&self) -> bool {
        matches!(self, Self::DriverReset { .. })
    }
}
