//! What a start pipeline has done so far, persisted after every stage so a
//! later `stop` can unwind it even if the starting process died.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WaptError};
use crate::fsutil;
use crate::manager::SuspendedManagers;
use crate::services::ProcessRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ManagersSuspended,
    InterfacePrepared,
    ForwardingEnabled,
    ApDaemonStarted,
    RecordWritten,
    FirewallApplied,
    DhcpDnsStarted,
    TimeServiceStarted,
    PortalStarted,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::ManagersSuspended => "managers suspended",
            Stage::InterfacePrepared => "interface prepared",
            Stage::ForwardingEnabled => "forwarding enabled",
            Stage::ApDaemonStarted => "AP daemon started",
            Stage::RecordWritten => "session record written",
            Stage::FirewallApplied => "firewall applied",
            Stage::DhcpDnsStarted => "DHCP/DNS started",
            Stage::TimeServiceStarted => "time service started",
            Stage::PortalStarted => "portal started",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionJournal {
    pub interface: String,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub suspended: SuspendedManagers,
    #[serde(default)]
    pub processes: ProcessRegistry,
    #[serde(default)]
    pub portal_root: Option<PathBuf>,
    /// Config files written for the daemons, removed on stop.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl SessionJournal {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            ..Self::default()
        }
    }

    pub fn mark(&mut self, stage: Stage) {
        if !self.stages.contains(&stage) {
            self.stages.push(stage);
        }
    }

    pub fn has(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    /// True when the start that wrote this journal never reached the point
    /// where the session became active.
    pub fn is_interrupted_start(&self) -> bool {
        !self.has(Stage::RecordWritten)
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| WaptError::parse(format!("session journal {}", path.display()), e.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WaptError::io(format!("reading {}", path.display()), err)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| WaptError::parse("session journal", e.to_string()))?;
        fsutil::write_atomic(path, &json, 0o600)
    }

    pub fn remove(path: &Path) -> Result<bool> {
        fsutil::remove_if_exists(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ServiceKind, ServiceProcessHandle};

    #[test]
    fn save_and_load_preserve_everything_stop_needs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        assert_eq!(SessionJournal::load(&path).unwrap(), None);

        let mut journal = SessionJournal::new("wlan0");
        journal.mark(Stage::ManagersSuspended);
        journal.mark(Stage::ManagersSuspended);
        journal.suspended.network_manager_was_running = true;
        journal
            .processes
            .insert(ServiceProcessHandle::new(ServiceKind::ApDaemon, 99));
        journal.save(&path).unwrap();

        let loaded = SessionJournal::load(&path).unwrap().unwrap();
        assert_eq!(loaded, journal);
        assert_eq!(loaded.stages, vec![Stage::ManagersSuspended]);
        assert!(loaded.is_interrupted_start());
        assert!(SessionJournal::remove(&path).unwrap());
    }

    #[test]
    fn corrupt_journal_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "{").unwrap();
        assert!(matches!(SessionJournal::load(&path), Err(WaptError::Parse { .. })));
    }
}
