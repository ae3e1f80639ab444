use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::system::ProcessSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    ApDaemon,
    DhcpDnsDaemon,
    TimeService,
    HttpServer,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceKind::ApDaemon => "AP daemon",
            ServiceKind::DhcpDnsDaemon => "DHCP/DNS daemon",
            ServiceKind::TimeService => "time service",
            ServiceKind::HttpServer => "captive portal server",
        })
    }
}

/// A background process the session started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProcessHandle {
    pub kind: ServiceKind,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
}

impl ServiceProcessHandle {
    pub fn new(kind: ServiceKind, pid: i32) -> Self {
        Self {
            kind,
            pid,
            started_at: Utc::now(),
        }
    }

    pub fn is_alive(&self, procs: &dyn ProcessSupervisor) -> bool {
        procs.is_alive(self.pid)
    }
}

/// Session-scoped handles, at most one per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessRegistry {
    handles: BTreeMap<ServiceKind, ServiceProcessHandle>,
}

impl ProcessRegistry {
    pub fn insert(&mut self, handle: ServiceProcessHandle) -> Option<ServiceProcessHandle> {
        self.handles.insert(handle.kind, handle)
    }

    pub fn get(&self, kind: ServiceKind) -> Option<&ServiceProcessHandle> {
        self.handles.get(&kind)
    }

    pub fn take(&mut self, kind: ServiceKind) -> Option<ServiceProcessHandle> {
        self.handles.remove(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceProcessHandle> {
        self.handles.values()
    }
}
