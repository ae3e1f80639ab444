//! The interface state machine.
//!
//! Every mutation of the wireless interface goes through here. Transitions
//! are requested and then observed: admin state is polled until it matches,
//! and a hard reset is only complete once the device node is back.
//!
//! Mode, address and hardware address changes are only applied to a
//! quiesced (admin down) device.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, WaptError};
use crate::mac::MacAddr;
use crate::retry::{self, RetryPolicy};
use crate::system::{LinkOps, UnitControl};

pub(crate) use wapt_logging::targets::T_IFACE as TARGET;

/// Drivers whose dependent module holds a reference on the base module and
/// has to be unloaded first. Reloading the base pulls the dependent back in.
const DEPENDENT_MODULES: &[(&str, &[&str])] = &[
    ("iwlwifi", &["iwlmvm", "iwldvm"]),
    ("brcmfmac", &["brcmfmac_wcc"]),
];

fn dependents_of(module: &str) -> &'static [&'static str] {
    DEPENDENT_MODULES
        .iter()
        .find(|(base, _)| *base == module)
        .map(|(_, deps)| *deps)
        .unwrap_or(&[])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Noop,
    BringUp,
    BringDown,
}

impl AdminState {
    pub fn from_flag(up: bool) -> Self {
        if up {
            AdminState::Up
        } else {
            AdminState::Down
        }
    }

    pub fn transition_to(self, desired: AdminState) -> Transition {
        match (self, desired) {
            (AdminState::Down, AdminState::Up) => Transition::BringUp,
            (AdminState::Up, AdminState::Down) => Transition::BringDown,
            _ => Transition::Noop,
        }
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdminState::Down => "DOWN",
            AdminState::Up => "UP",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationalMode {
    Managed,
    Monitor,
    Ap,
    Other(String),
}

impl OperationalMode {
    pub fn from_iw_type(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "managed" => OperationalMode::Managed,
            "monitor" => OperationalMode::Monitor,
            "ap" | "__ap" => OperationalMode::Ap,
            other => OperationalMode::Other(other.to_string()),
        }
    }

    /// The `iw dev <if> set type` argument.
    pub fn iw_type(&self) -> &str {
        match self {
            OperationalMode::Managed => "managed",
            OperationalMode::Monitor => "monitor",
            OperationalMode::Ap => "__ap",
            OperationalMode::Other(raw) => raw,
        }
    }
}

impl fmt::Display for OperationalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationalMode::Managed => f.write_str("managed"),
            OperationalMode::Monitor => f.write_str("monitor"),
            OperationalMode::Ap => f.write_str("AP"),
            OperationalMode::Other(raw) => f.write_str(raw),
        }
    }
}

impl std::str::FromStr for OperationalMode {
    type Err = WaptError;

    fn from_str(s: &str) -> Result<Self> {
        match OperationalMode::from_iw_type(s.trim()) {
            OperationalMode::Other(raw) => Err(WaptError::parse(
                "interface mode",
                format!("'{raw}' is not one of managed, monitor, ap"),
            )),
            mode => Ok(mode),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    pub name: String,
    pub admin: AdminState,
    pub mode: OperationalMode,
    pub hardware_address: Option<MacAddr>,
}

pub struct InterfaceMachine {
    name: String,
    link: Arc<dyn LinkOps>,
    units: Arc<dyn UnitControl>,
    manager_unit: String,
    poll: RetryPolicy,
    device_poll: RetryPolicy,
    soft_settle: Duration,
    bssid_override: Option<MacAddr>,
}

impl InterfaceMachine {
    pub fn new(
        name: impl Into<String>,
        link: Arc<dyn LinkOps>,
        units: Arc<dyn UnitControl>,
        manager_unit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            link,
            units,
            manager_unit: manager_unit.into(),
            poll: RetryPolicy::default(),
            device_poll: RetryPolicy::fixed(20, Duration::from_millis(500)),
            soft_settle: Duration::from_secs(3),
            bssid_override: None,
        }
    }

    pub fn with_timing(mut self, poll: RetryPolicy, device_poll: RetryPolicy, soft_settle: Duration) -> Self {
        self.poll = poll;
        self.device_poll = device_poll;
        self.soft_settle = soft_settle;
        self
    }

    /// While an override is pending, `bring_down` leaves the hardware
    /// address alone instead of restoring the factory value.
    pub fn with_bssid_override(mut self, bssid: Option<MacAddr>) -> Self {
        self.bssid_override = bssid;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn admin_state(&self) -> Result<AdminState> {
        self.link.admin_is_up(&self.name).map(AdminState::from_flag)
    }

    fn converge(&self, desired: AdminState) -> Result<()> {
        let current = self.admin_state()?;
        match current.transition_to(desired) {
            Transition::Noop => {
                debug!(target: TARGET, interface = %self.name, state = %desired, "already converged");
                return Ok(());
            }
            Transition::BringUp => self.link.set_admin(&self.name, true)?,
            Transition::BringDown => self.link.set_admin(&self.name, false)?,
        }

        let what = format!("{} {}", self.name, desired);
        match self
            .poll
            .poll(&what, || Ok(self.admin_state()? == desired))
        {
            Ok(attempts) => {
                info!(target: TARGET, interface = %self.name, state = %desired, attempts, "admin state converged");
                Ok(())
            }
            Err(timeout) => Err(WaptError::InterfaceTimeout {
                interface: self.name.clone(),
                desired: desired.to_string(),
                attempts: timeout.attempts,
            }),
        }
    }

    fn ensure_quiesced(&self, action: &str) -> Result<()> {
        if self.admin_state()? == AdminState::Up {
            return Err(WaptError::IllegalTransition {
                interface: self.name.clone(),
                action: action.to_string(),
            });
        }
        Ok(())
    }

    pub fn bring_up(&self) -> Result<()> {
        self.converge(AdminState::Up)
    }

    /// Brings the link down, flushes its addresses, and restores the factory
    /// hardware address unless a BSSID override is pending.
    pub fn bring_down(&self) -> Result<()> {
        self.converge(AdminState::Down)?;
        self.link.flush_addresses(&self.name)?;

        if self.bssid_override.is_some() {
            debug!(target: TARGET, interface = %self.name, "BSSID override pending; keeping hardware address");
            return Ok(());
        }
        self.restore_factory_address()
    }

    fn restore_factory_address(&self) -> Result<()> {
        let factory = match self.link.factory_address(&self.name) {
            Ok(Some(mac)) => mac,
            Ok(None) => {
                debug!(target: TARGET, interface = %self.name, "no permanent address reported");
                return Ok(());
            }
            Err(err) => {
                warn!(target: TARGET, interface = %self.name, "cannot read permanent address: {err}");
                return Ok(());
            }
        };
        let current = self.link.hardware_address(&self.name)?;
        if current == factory {
            return Ok(());
        }

        self.ensure_quiesced("change the hardware address")?;
        self.link.set_hardware_address(&self.name, factory)?;
        info!(target: TARGET, interface = %self.name, from = %current, to = %factory, "restored factory address");
        Ok(())
    }

    pub fn set_mode(&self, mode: OperationalMode) -> Result<()> {
        self.bring_down()?;
        let current = self.link.mode(&self.name)?;
        if current != mode {
            self.ensure_quiesced("change the operational mode")?;
            self.link.set_mode(&self.name, &mode)?;
            info!(target: TARGET, interface = %self.name, from = %current, to = %mode, "mode changed");
        }
        self.bring_up()
    }

    /// Assigns the gateway address on a quiesced device. The mode is left
    /// for the AP daemon to claim.
    pub fn setup_for_access_point(&self, gateway: Ipv4Net) -> Result<()> {
        self.bring_down()?;
        self.ensure_quiesced("assign an address")?;
        self.link.add_address(&self.name, gateway)?;
        self.bring_up()?;
        info!(target: TARGET, interface = %self.name, %gateway, "interface ready for AP");
        Ok(())
    }

    /// Returns the interface to managed mode and hands it back to the
    /// network manager. The manager's convergence is not observable, so this
    /// ends with a fixed settle delay.
    pub fn reset_soft(&self) -> Result<()> {
        self.set_mode(OperationalMode::Managed)?;
        if let Err(err) = self.units.restart(&self.manager_unit) {
            warn!(target: TARGET, unit = %self.manager_unit, "restart failed: {err}");
        }
        retry::settle(self.soft_settle);
        info!(target: TARGET, interface = %self.name, "soft reset complete");
        Ok(())
    }

    /// Reloads the interface's kernel driver. Terminal on failure: the
    /// caller gets `DriverReset` and nothing is retried past the bound.
    pub fn reset_hard(&self) -> Result<()> {
        let manager_was_active = match self.units.is_active(&self.manager_unit) {
            Ok(active) => active,
            Err(err) => {
                warn!(target: TARGET, unit = %self.manager_unit, "cannot query: {err}");
                false
            }
        };
        if manager_was_active {
            self.units.stop(&self.manager_unit)?;
            info!(target: TARGET, unit = %self.manager_unit, "stopped for driver reload");
        }

        match self.reload_driver() {
            Ok(()) => self.reset_soft(),
            Err(err) => {
                if manager_was_active {
                    if let Err(restart_err) = self.units.start(&self.manager_unit) {
                        warn!(target: TARGET, unit = %self.manager_unit, "restart after failed reset: {restart_err}");
                    }
                }
                Err(err)
            }
        }
    }

    fn reload_driver(&self) -> Result<()> {
        self.bring_down()?;

        let module = self
            .link
            .driver_module(&self.name)?
            .ok_or_else(|| WaptError::driver_reset(&self.name, "no driver module bound to the device"))?;

        for dependent in dependents_of(&module) {
            if self.link.module_loaded(dependent) {
                self.link.unload_module(dependent).map_err(|e| {
                    WaptError::driver_reset(&self.name, format!("unloading {dependent}: {e}"))
                })?;
                info!(target: TARGET, module = dependent, "unloaded dependent module");
            }
        }
        self.link
            .unload_module(&module)
            .map_err(|e| WaptError::driver_reset(&self.name, format!("unloading {module}: {e}")))?;
        info!(target: TARGET, %module, "unloaded driver");

        self.link
            .load_module(&module)
            .map_err(|e| WaptError::driver_reset(&self.name, format!("loading {module}: {e}")))?;

        let what = format!("{} device node", self.name);
        match self
            .device_poll
            .poll(&what, || Ok(self.link.device_present(&self.name)))
        {
            Ok(attempts) => {
                info!(target: TARGET, interface = %self.name, %module, attempts, "driver reloaded");
                Ok(())
            }
            Err(timeout) => Err(WaptError::driver_reset(
                &self.name,
                format!(
                    "device did not reappear after reloading {module} ({} checks)",
                    timeout.attempts
                ),
            )),
        }
    }

    /// Read-only snapshot for display.
    pub fn status(&self) -> Result<InterfaceStatus> {
        Ok(InterfaceStatus {
            name: self.name.clone(),
            admin: self.admin_state()?,
            mode: self.link.mode(&self.name)?,
            hardware_address: self.link.hardware_address(&self.name).ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeHost;

    fn machine(host: &FakeHost) -> InterfaceMachine {
        host.machine()
    }

    #[test]
    fn transition_table() {
        assert_eq!(AdminState::Down.transition_to(AdminState::Up), Transition::BringUp);
        assert_eq!(AdminState::Up.transition_to(AdminState::Down), Transition::BringDown);
        assert_eq!(AdminState::Up.transition_to(AdminState::Up), Transition::Noop);
        assert_eq!(AdminState::Down.transition_to(AdminState::Down), Transition::Noop);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("monitor".parse::<OperationalMode>().unwrap(), OperationalMode::Monitor);
        assert_eq!("AP".parse::<OperationalMode>().unwrap(), OperationalMode::Ap);
        assert!("mesh".parse::<OperationalMode>().is_err());
        assert_eq!(OperationalMode::Ap.iw_type(), "__ap");
    }

    #[test]
    fn bring_up_waits_for_lagging_device() {
        let host = FakeHost::new();
        host.with_state(|s| {
            s.admin_up = false;
            s.admin_lag = 2;
        });
        machine(&host).bring_up().unwrap();
        assert!(host.state().admin_up);
    }

    #[test]
    fn bring_up_times_out_when_device_never_converges() {
        let host = FakeHost::new();
        host.with_state(|s| {
            s.admin_up = false;
            s.admin_stuck = true;
        });
        let err = machine(&host).bring_up().unwrap_err();
        assert!(matches!(err, WaptError::InterfaceTimeout { attempts: 3, .. }), "{err}");
    }

    #[test]
    fn converged_operations_are_noops() {
        let host = FakeHost::new();
        let ism = machine(&host);
        ism.bring_up().unwrap();
        ism.bring_up().unwrap();
        assert_eq!(host.state().admin_toggles, 0);
    }

    #[test]
    fn bring_down_restores_factory_address() {
        let host = FakeHost::new();
        host.with_state(|s| s.current_mac = MacAddr::locally_administered(9));
        machine(&host).bring_down().unwrap();
        let state = host.state();
        assert_eq!(state.current_mac, state.factory_mac);
        assert!(state.addresses.is_empty());
        assert!(state.violations.is_empty(), "{:?}", state.violations);
    }

    #[test]
    fn bring_down_keeps_pending_override() {
        let host = FakeHost::new();
        let custom = MacAddr::locally_administered(9);
        host.with_state(|s| s.current_mac = custom);
        machine(&host)
            .with_bssid_override(Some(custom))
            .bring_down()
            .unwrap();
        assert_eq!(host.state().current_mac, custom);
    }

    #[test]
    fn set_mode_goes_through_down() {
        let host = FakeHost::new();
        machine(&host).set_mode(OperationalMode::Monitor).unwrap();
        let state = host.state();
        assert_eq!(state.mode, OperationalMode::Monitor);
        assert!(state.admin_up);
        assert!(state.violations.is_empty(), "{:?}", state.violations);
    }

    #[test]
    fn setup_for_access_point_assigns_gateway_without_touching_mode() {
        let host = FakeHost::new();
        let gw: Ipv4Net = "10.0.0.1/24".parse().unwrap();
        machine(&host).setup_for_access_point(gw).unwrap();
        let state = host.state();
        assert_eq!(state.addresses, vec![gw]);
        assert_eq!(state.mode, OperationalMode::Managed);
        assert!(state.admin_up);
        assert!(state.violations.is_empty(), "{:?}", state.violations);
    }

    #[test]
    fn reset_soft_is_idempotent() {
        let host = FakeHost::new();
        host.with_state(|s| s.mode = OperationalMode::Ap);
        let ism = machine(&host);

        ism.reset_soft().unwrap();
        let once = (host.state().admin_up, host.state().mode.clone());
        ism.reset_soft().unwrap();
        let twice = (host.state().admin_up, host.state().mode.clone());

        assert_eq!(once, (true, OperationalMode::Managed));
        assert_eq!(once, twice);
        assert_eq!(host.state().unit_restarts, 2);
    }

    #[test]
    fn reset_soft_tolerates_manager_restart_failure() {
        let host = FakeHost::new();
        host.with_state(|s| s.fail_unit_restart = true);
        machine(&host).reset_soft().unwrap();
    }

    #[test]
    fn reset_hard_unloads_dependents_first_and_reloads_base() {
        let host = FakeHost::new();
        host.with_state(|s| {
            s.driver = Some("iwlwifi".into());
            s.loaded_modules = vec!["iwlwifi".into(), "iwlmvm".into()];
        });
        machine(&host).reset_hard().unwrap();

        let state = host.state();
        assert_eq!(
            state.module_log,
            vec!["-iwlmvm", "-iwlwifi", "+iwlwifi"]
        );
        assert!(state.device_present);
        assert!(state.loaded_modules.contains(&"iwlwifi".to_string()));
        assert!(state.loaded_modules.contains(&"iwlmvm".to_string()));
        assert!(state.admin_up);
        assert_eq!(state.mode, OperationalMode::Managed);
        assert!(state.manager_active);
    }

    #[test]
    fn reset_hard_fails_when_device_never_returns() {
        let host = FakeHost::new();
        host.with_state(|s| {
            s.driver = Some("mt76x2u".into());
            s.loaded_modules = vec!["mt76x2u".into()];
            s.device_returns = false;
        });
        let err = machine(&host).reset_hard().unwrap_err();
        assert!(matches!(err, WaptError::DriverReset { .. }), "{err}");
        assert!(err.requires_operator());
        // The manager it stopped is given back even on failure.
        assert!(host.state().manager_active);
    }

    #[test]
    fn reset_hard_fails_without_a_driver() {
        let host = FakeHost::new();
        host.with_state(|s| s.driver = None);
        let err = machine(&host).reset_hard().unwrap_err();
        assert!(matches!(err, WaptError::DriverReset { .. }), "{err}");
    }

    #[test]
    fn status_is_read_only() {
        let host = FakeHost::new();
        let before = host.state().admin_toggles;
        let status = machine(&host).status().unwrap();
        assert_eq!(status.admin, AdminState::Up);
        assert_eq!(status.mode, OperationalMode::Managed);
        assert_eq!(host.state().admin_toggles, before);
    }
}
