//! Suspends the host's own network manager and supplicant while the
//! interface is mutated directly, and restores only what was stopped here.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::retry;
use crate::system::{ProcessSupervisor, UnitControl};

pub(crate) use wapt_logging::targets::T_IFACE as TARGET;

/// What a suspend actually stopped. Passed by value to `restore` and kept
/// in the session journal when the AP session owns the restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendedManagers {
    pub network_manager_was_running: bool,
    pub supplicant_was_running: bool,
}

impl SuspendedManagers {
    pub fn is_empty(&self) -> bool {
        !self.network_manager_was_running && !self.supplicant_was_running
    }
}

/// Why managers are being suspended; decides who restores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Restored as soon as the operation returns.
    Maintenance,
    /// Restore is handed to session teardown so the AP daemon keeps the
    /// interface for the life of the session. Restored here only on error.
    PrepareAccessPoint,
}

pub trait ResourceCoordinator: Send + Sync {
    fn suspend(&self) -> Result<SuspendedManagers>;
    fn restore(&self, flags: SuspendedManagers) -> Result<()>;
}

pub struct ManagerCoordinator {
    units: Arc<dyn UnitControl>,
    procs: Arc<dyn ProcessSupervisor>,
    network_manager_unit: String,
    supplicant: String,
    settle: Duration,
}

impl ManagerCoordinator {
    pub fn new(
        units: Arc<dyn UnitControl>,
        procs: Arc<dyn ProcessSupervisor>,
        network_manager_unit: impl Into<String>,
        supplicant: impl Into<String>,
        settle: Duration,
    ) -> Self {
        Self {
            units,
            procs,
            network_manager_unit: network_manager_unit.into(),
            supplicant: supplicant.into(),
            settle,
        }
    }
}

impl ResourceCoordinator for ManagerCoordinator {
    fn suspend(&self) -> Result<SuspendedManagers> {
        let unit = &self.network_manager_unit;
        let manager_active = match self.units.is_active(unit) {
            Ok(active) => active,
            Err(err) => {
                warn!(target: TARGET, %unit, "cannot query: {err}");
                false
            }
        };
        let supplicant_pids = self.procs.find(&self.supplicant).unwrap_or_else(|err| {
            warn!(target: TARGET, process = %self.supplicant, "cannot scan processes: {err}");
            Vec::new()
        });

        let flags = SuspendedManagers {
            network_manager_was_running: manager_active,
            supplicant_was_running: !supplicant_pids.is_empty(),
        };

        if manager_active {
            self.units.stop(unit)?;
            info!(target: TARGET, %unit, "suspended network manager");
        }
        for pid in &supplicant_pids {
            if let Err(err) = self.procs.terminate(*pid) {
                warn!(target: TARGET, pid, "failed to stop supplicant: {err}");
            }
        }
        if flags.supplicant_was_running {
            info!(target: TARGET, count = supplicant_pids.len(), "stopped supplicant");
        }

        if !flags.is_empty() {
            retry::settle(self.settle);
        }
        Ok(flags)
    }

    fn restore(&self, flags: SuspendedManagers) -> Result<()> {
        if !flags.network_manager_was_running {
            return Ok(());
        }
        let unit = &self.network_manager_unit;
        if self.units.is_active(unit).unwrap_or(false) {
            info!(target: TARGET, %unit, "network manager already running");
            return Ok(());
        }
        self.units.start(unit)?;
        info!(target: TARGET, %unit, "restored network manager");
        Ok(())
    }
}

/// Runs `op` with managers suspended.
///
/// Returns the operation's value and, for `PrepareAccessPoint` only, the
/// flags the caller now owes a restore.
pub fn with_suspended<T, F>(
    coordinator: &dyn ResourceCoordinator,
    purpose: Purpose,
    op: F,
) -> Result<(T, Option<SuspendedManagers>)>
where
    F: FnOnce() -> Result<T>,
{
    let flags = coordinator.suspend()?;
    let outcome = op();

    let hand_off = purpose == Purpose::PrepareAccessPoint && outcome.is_ok();
    if hand_off {
        return outcome.map(|value| (value, Some(flags)));
    }

    if let Err(err) = coordinator.restore(flags) {
        warn!(target: TARGET, "failed to restore managers: {err}");
    }
    outcome.map(|value| (value, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WaptError;
    use crate::fakes::FakeHost;

    #[test]
    fn suspend_records_only_what_was_running() {
        let host = FakeHost::new();
        host.with_state(|s| s.manager_active = false);
        let flags = host.coordinator().suspend().unwrap();
        assert_eq!(flags, SuspendedManagers::default());

        let host = FakeHost::new();
        host.with_state(|s| s.supplicant_pids = vec![400]);
        let flags = host.coordinator().suspend().unwrap();
        assert!(flags.network_manager_was_running);
        assert!(flags.supplicant_was_running);
        let state = host.state();
        assert!(!state.manager_active);
        assert!(state.supplicant_pids.is_empty());
    }

    #[test]
    fn restore_never_starts_what_it_did_not_stop() {
        let host = FakeHost::new();
        host.with_state(|s| s.manager_active = false);
        host.coordinator()
            .restore(SuspendedManagers::default())
            .unwrap();
        assert!(!host.state().manager_active);
    }

    #[test]
    fn maintenance_restores_immediately() {
        let host = FakeHost::new();
        let coordinator = host.coordinator();
        let ((), owed) = with_suspended(&coordinator, Purpose::Maintenance, || {
            assert!(!host.state().manager_active);
            Ok(())
        })
        .unwrap();
        assert!(owed.is_none());
        assert!(host.state().manager_active);
    }

    #[test]
    fn prepare_access_point_hands_restore_to_caller() {
        let host = FakeHost::new();
        let coordinator = host.coordinator();
        let ((), owed) =
            with_suspended(&coordinator, Purpose::PrepareAccessPoint, || Ok(())).unwrap();
        assert_eq!(
            owed.map(|f| f.network_manager_was_running),
            Some(true)
        );
        assert!(!host.state().manager_active);
    }

    #[test]
    fn prepare_access_point_restores_on_failure() {
        let host = FakeHost::new();
        let coordinator = host.coordinator();
        let err = with_suspended(&coordinator, Purpose::PrepareAccessPoint, || {
            Err::<(), _>(WaptError::Validation("boom".into()))
        })
        .unwrap_err();
        assert!(matches!(err, WaptError::Validation(_)));
        assert!(host.state().manager_active);
    }
}
