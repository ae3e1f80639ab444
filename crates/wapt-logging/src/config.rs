use serde::{Deserialize, Serialize};

/// Persisted as `<root>/config/logging.json`. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// `EnvFilter` directive; `WAPT_LOG` overrides it at startup.
    pub level: String,
    pub keep_days: u64,
    /// Rotated logs are trimmed oldest-first above this total.
    pub max_total_mib: u64,
}

impl LoggingConfig {
    pub fn max_total_bytes(&self) -> u64 {
        self.max_total_mib.saturating_mul(1024 * 1024)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            keep_days: 14,
            max_total_mib: 200,
        }
    }
}
