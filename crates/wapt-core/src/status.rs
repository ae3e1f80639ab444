//! The session record: one pipe-delimited line that both locks the host
//! against a second start and describes the running session to displays.
//!
//! Format: `timestamp|ssid|bssid|channel|nat|nonat`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use wapt_logging::targets::T_SESSION;

use crate::error::{Result, WaptError};
use crate::fsutil;
use crate::mac::MacAddr;

/// Records older than this are shown as stopped. They still lock.
pub const DISPLAY_EXPIRY_SECS: i64 = 900;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub started_at: i64,
    pub ssid: String,
    pub bssid: MacAddr,
    pub channel: u8,
    pub nat_enabled: bool,
}

impl SessionRecord {
    pub fn nat_state(&self) -> &'static str {
        if self.nat_enabled {
            "nat"
        } else {
            "nonat"
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.started_at,
            self.ssid,
            self.bssid,
            self.channel,
            self.nat_state()
        )
    }

    /// Parses a record line. The SSID may itself contain `|`, so the
    /// timestamp is split from the front and the rest from the back.
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (ts, rest) = line
            .split_once('|')
            .ok_or_else(|| WaptError::parse("session record", "no fields"))?;
        let mut tail = rest.rsplitn(4, '|');
        let nat = tail.next();
        let channel = tail.next();
        let bssid = tail.next();
        let ssid = tail.next();
        let (Some(nat), Some(channel), Some(bssid), Some(ssid)) = (nat, channel, bssid, ssid) else {
            return Err(WaptError::parse(
                "session record",
                format!("expected 5 fields in '{line}'"),
            ));
        };

        let started_at = ts
            .trim()
            .parse::<i64>()
            .map_err(|e| WaptError::parse("session record timestamp", e.to_string()))?;
        let channel = channel
            .trim()
            .parse::<u8>()
            .map_err(|e| WaptError::parse("session record channel", e.to_string()))?;
        let nat_enabled = match nat.trim() {
            "nat" => true,
            "nonat" => false,
            other => {
                return Err(WaptError::parse(
                    "session record",
                    format!("unknown NAT state '{other}'"),
                ))
            }
        };

        Ok(Self {
            started_at,
            ssid: ssid.to_string(),
            bssid: bssid.parse()?,
            channel,
            nat_enabled,
        })
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now.saturating_sub(self.started_at) > DISPLAY_EXPIRY_SECS
    }

    /// `Running (HH:MM:SS, ssid, CH n, BSSID b)` or `Stopped` once expired.
    pub fn summary(&self, now: i64) -> String {
        if self.is_expired(now) {
            return "Stopped".to_string();
        }
        let elapsed = now.saturating_sub(self.started_at).max(0);
        format!(
            "Running ({:02}:{:02}:{:02}, {}, CH {}, BSSID {})",
            elapsed / 3600,
            (elapsed % 3600) / 60,
            elapsed % 60,
            self.ssid,
            self.channel,
            self.bssid
        )
    }
}

#[derive(Debug, Clone)]
pub struct StatusTracker {
    path: PathBuf,
}

impl StatusTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Presence alone means "AP active", whatever the content.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<Option<SessionRecord>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => {
                let line = text.lines().next().unwrap_or("");
                SessionRecord::parse_line(line).map(Some)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WaptError::io(format!("reading {}", self.path.display()), err)),
        }
    }

    pub fn write(&self, record: &SessionRecord) -> Result<()> {
        let mut line = record.to_line();
        line.push('\n');
        fsutil::write_atomic(&self.path, line.as_bytes(), 0o644)?;
        tracing::info!(target: T_SESSION, path = %self.path.display(), "session record written");
        Ok(())
    }

    /// Returns whether a record was present.
    pub fn clear(&self) -> Result<bool> {
        fsutil::remove_if_exists(&self.path)
    }

    /// Display text for status panels; unreadable records still show as
    /// running since they still hold the lock.
    pub fn summary(&self, now: i64) -> String {
        match self.read() {
            Ok(Some(record)) => record.summary(now),
            Ok(None) => "Stopped".to_string(),
            Err(err) => {
                tracing::warn!(target: T_SESSION, "unreadable session record: {err}");
                "Running (unreadable record)".to_string()
            }
        }
    }
}
