//! The AP session pipelines.
//!
//! `start` walks the stages in order and registers an undo for each one it
//! completes; any failure unwinds exactly those. `stop` is the full reverse
//! and assumes nothing: it works from the journal when there is one, falls
//! back to pattern matching when there is not, and turns every missing
//! piece into a warning.

pub mod journal;

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::WaptConfig;
use crate::error::{Result, WaptError};
use crate::fsutil;
use crate::hostapd;
use crate::interface::InterfaceMachine;
use crate::mac::MacAddr;
use crate::manager::{with_suspended, ManagerCoordinator, Purpose, ResourceCoordinator};
use crate::profile::{self, ProfileSpec};
use crate::retry;
use crate::rollback::RollbackGuard;
use crate::services::{ProcessRegistry, ServiceCoordinator, ServiceKind, ServiceProcessHandle};
use crate::status::{SessionRecord, StatusTracker};
use crate::system::{nat_rules, Host};

pub use journal::{SessionJournal, Stage};

pub(crate) use wapt_logging::targets::T_SESSION as TARGET;

#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// Profile name under the profiles directory.
    pub profile: String,
    pub nat: bool,
    /// Takes precedence over the profile's own override.
    pub bssid: Option<MacAddr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub record: SessionRecord,
    pub config_path: PathBuf,
    pub portal_root: Option<PathBuf>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    pub hard_reset: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StopReport {
    pub record_cleared: bool,
    pub journal_found: bool,
    /// Start stages the journal recorded as completed.
    pub stages: Vec<Stage>,
    pub warnings: Vec<String>,
}

pub struct SessionOrchestrator {
    cfg: WaptConfig,
    host: Host,
    status: StatusTracker,
}

impl SessionOrchestrator {
    pub fn new(cfg: WaptConfig, host: Host) -> Self {
        let status = StatusTracker::new(cfg.status_path.clone());
        Self { cfg, host, status }
    }

    pub fn config(&self) -> &WaptConfig {
        &self.cfg
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    pub fn coordinator(&self) -> ManagerCoordinator {
        ManagerCoordinator::new(
            self.host.units.clone(),
            self.host.procs.clone(),
            self.cfg.network_manager_unit.clone(),
            self.cfg.supplicant_process.clone(),
            self.cfg.settle(),
        )
    }

    pub fn interface(&self, bssid_override: Option<MacAddr>) -> InterfaceMachine {
        InterfaceMachine::new(
            self.cfg.interface.clone(),
            self.host.link.clone(),
            self.host.units.clone(),
            self.cfg.network_manager_unit.clone(),
        )
        .with_timing(
            self.cfg.admin_poll(),
            self.cfg.device_poll(),
            self.cfg.soft_reset_settle(),
        )
        .with_bssid_override(bssid_override)
    }

    pub fn services(&self) -> ServiceCoordinator<'_> {
        ServiceCoordinator::new(&self.cfg, self.host.procs.clone(), self.host.units.clone())
    }

    fn reject_if_active(&self) -> Result<()> {
        if !self.status.exists() {
            return Ok(());
        }
        let (ssid, channel) = match self.status.read() {
            Ok(Some(record)) => (record.ssid, record.channel.to_string()),
            _ => ("unknown".to_string(), "?".to_string()),
        };
        Err(WaptError::SessionActive { ssid, channel })
    }

    /// Brings up an access point for `request`.
    ///
    /// Nothing on the host is touched until the lock check, the profile and
    /// the rendered configuration have all passed.
    pub fn start(&self, request: &SessionRequest) -> Result<StartOutcome> {
        self.reject_if_active()?;
        if let Some(bssid) = request.bssid {
            profile::validate_bssid(bssid)?;
        }

        let profile = profile::load_profile(&self.cfg.profiles_dir, &request.profile)?;
        let template = hostapd::load_template(&self.cfg.templates_dir)?;
        let mut rendered = hostapd::render(&template, &profile, &self.cfg.interface, &self.cfg.driver);

        let bssid_override = request.bssid.or(profile.bssid_override);
        let bssid = match bssid_override {
            Some(mac) => mac,
            None => self.host.link.hardware_address(&self.cfg.interface)?,
        };
        hostapd::append_bssid(&mut rendered, bssid);

        info!(
            target: TARGET,
            profile = %request.profile,
            ssid = %profile.ssid,
            channel = profile.channel,
            %bssid,
            nat = request.nat,
            security = profile.security_mode.label(),
            "starting access point"
        );

        let config_path = self.cfg.hostapd_conf_path();
        let journal_path = self.cfg.journal_path();
        let mut journal = SessionJournal::new(self.cfg.interface.clone());
        journal.files.push(config_path.clone());
        journal.files.push(self.cfg.dnsmasq_conf_path());

        let mut guard = RollbackGuard::new("access point start");
        let result = self.run_start_stages(
            &mut guard,
            &mut journal,
            &profile,
            &rendered,
            bssid,
            bssid_override,
            request.nat,
        );

        match result {
            Ok((record, portal_root, warnings)) => {
                guard.commit();
                info!(target: TARGET, ssid = %record.ssid, "access point running");
                Ok(StartOutcome {
                    record,
                    config_path,
                    portal_root,
                    warnings,
                })
            }
            Err(err) => {
                error!(target: TARGET, "start failed, unwinding: {err}");
                for undo_err in guard.rollback() {
                    warn!(target: TARGET, "cleanup step failed: {undo_err:#}");
                }
                if let Err(rm_err) = SessionJournal::remove(&journal_path) {
                    warn!(target: TARGET, "cannot remove journal: {rm_err}");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_start_stages<'s>(
        &'s self,
        guard: &mut RollbackGuard<'s>,
        journal: &mut SessionJournal,
        profile: &ProfileSpec,
        rendered: &str,
        bssid: MacAddr,
        bssid_override: Option<MacAddr>,
        nat: bool,
    ) -> Result<(SessionRecord, Option<PathBuf>, Vec<String>)> {
        let cfg = &self.cfg;
        let journal_path = cfg.journal_path();
        let config_path = cfg.hostapd_conf_path();
        let mut warnings = Vec::new();

        let files = journal.files.clone();
        guard.register("remove daemon config", move || {
            for file in &files {
                fsutil::remove_if_exists(file)?;
            }
            Ok(())
        });
        fsutil::write_atomic(&config_path, rendered.as_bytes(), 0o600)?;
        journal.save(&journal_path)?;

        // Managers stay down for the whole session; the journal carries the
        // restore obligation to `stop`.
        let ism = self.interface(bssid_override);
        let coordinator = self.coordinator();
        let ((), owed) = with_suspended(&coordinator, Purpose::PrepareAccessPoint, || {
            let prepared = ism.setup_for_access_point(cfg.gateway);
            if prepared.is_err() {
                // No undo is registered yet; put the interface back before
                // the managers are restored.
                if let Err(err) = self.interface(None).reset_soft() {
                    warn!(target: TARGET, "interface reset after failed prepare: {err}");
                }
            }
            prepared
        })?;
        let suspended = owed.unwrap_or_default();
        guard.register("restore managers", move || {
            self.coordinator().restore(suspended)?;
            Ok(())
        });
        guard.register("reset interface", move || {
            self.interface(None).reset_soft()?;
            Ok(())
        });
        journal.suspended = suspended;
        journal.mark(Stage::ManagersSuspended);
        journal.mark(Stage::InterfacePrepared);
        journal.save(&journal_path)?;

        self.host.link.set_ip_forwarding(true)?;
        guard.register("disable forwarding", move || {
            self.host.link.set_ip_forwarding(false)?;
            Ok(())
        });
        journal.mark(Stage::ForwardingEnabled);
        journal.save(&journal_path)?;

        let args = vec![config_path.display().to_string()];
        let pid = self.host.procs.spawn(&cfg.hostapd_bin, &args)?;
        guard.register("stop AP daemon", move || {
            if self.host.procs.is_alive(pid) {
                self.host.procs.terminate(pid)?;
            }
            Ok(())
        });
        retry::settle(cfg.daemon_grace());
        let handle = ServiceProcessHandle::new(ServiceKind::ApDaemon, pid);
        if !handle.is_alive(self.host.procs.as_ref()) {
            return Err(WaptError::daemon_start(
                &cfg.hostapd_bin,
                format!("pid {pid} exited during startup; check {}", config_path.display()),
            ));
        }
        info!(target: TARGET, pid, "AP daemon running");
        journal.processes.insert(handle);
        journal.mark(Stage::ApDaemonStarted);
        journal.save(&journal_path)?;

        let record = SessionRecord {
            started_at: Utc::now().timestamp(),
            ssid: profile.ssid.clone(),
            bssid,
            channel: profile.channel,
            nat_enabled: nat,
        };
        self.status.write(&record)?;
        guard.register("clear session record", move || {
            self.status.clear()?;
            Ok(())
        });
        journal.mark(Stage::RecordWritten);
        journal.save(&journal_path)?;

        if nat {
            guard.register("flush firewall", move || {
                self.host.firewall.flush_all()?;
                Ok(())
            });
            let rules = nat_rules(&cfg.interface, &cfg.egress_interface, cfg.gateway);
            for rule in &rules {
                self.host.firewall.insert(rule)?;
                info!(target: TARGET, %rule, "firewall rule inserted");
            }
            let listed = self.host.firewall.list_rules()?;
            if let Some(missing) = rules.iter().find(|rule| !rule.is_listed(&listed)) {
                return Err(WaptError::Firewall {
                    rule: missing.to_string(),
                    reason: "accepted but not present in the rule listing".into(),
                });
            }
            journal.mark(Stage::FirewallApplied);
            journal.save(&journal_path)?;
        }

        let services = self.services();
        services.start_dhcp_dns(&mut journal.processes)?;
        let dhcp = journal.processes.get(ServiceKind::DhcpDnsDaemon).cloned();
        guard.register("stop DHCP/DNS daemon", move || {
            let mut registry = ProcessRegistry::default();
            if let Some(handle) = dhcp {
                registry.insert(handle);
            }
            let mut notes = Vec::new();
            self.services().stop_dhcp_dns(&mut registry, &mut notes);
            for note in notes {
                warn!(target: TARGET, "{note}");
            }
            Ok(())
        });
        journal.mark(Stage::DhcpDnsStarted);
        journal.save(&journal_path)?;

        services.start_time_service(&mut journal.processes);
        if let Some(time) = journal.processes.get(ServiceKind::TimeService).cloned() {
            guard.register("stop time service", move || {
                let mut registry = ProcessRegistry::default();
                registry.insert(time);
                let mut notes = Vec::new();
                self.services().stop_time_service(&mut registry, &mut notes);
                Ok(())
            });
            journal.mark(Stage::TimeServiceStarted);
            journal.save(&journal_path)?;
        }

        let portal_root = services.start_portal(&mut journal.processes);
        match &portal_root {
            Some(root) => {
                let root = root.clone();
                let http = journal.processes.get(ServiceKind::HttpServer).cloned();
                guard.register("stop captive portal", move || {
                    let mut registry = ProcessRegistry::default();
                    if let Some(handle) = http {
                        registry.insert(handle);
                    }
                    let mut notes = Vec::new();
                    self.services().stop_portal(&mut registry, Some(root.as_path()), &mut notes);
                    Ok(())
                });
                journal.portal_root = portal_root.clone();
                journal.mark(Stage::PortalStarted);
                journal.save(&journal_path)?;
            }
            None => warnings.push("captive portal not started".to_string()),
        }

        Ok((record, portal_root, warnings))
    }

    /// Tears the session down in reverse. Safe to call with nothing running
    /// and after an interrupted start. Only a failed hard reset is an error,
    /// and it is returned after every other step has run.
    pub fn stop(&self, options: StopOptions) -> Result<StopReport> {
        let mut report = StopReport::default();
        let journal_path = self.cfg.journal_path();
        let journal = match SessionJournal::load(&journal_path) {
            Ok(journal) => journal,
            Err(err) => {
                report.warnings.push(format!("ignoring unreadable journal: {err}"));
                None
            }
        };
        report.journal_found = journal.is_some();
        if let Some(j) = &journal {
            report.stages = j.stages.clone();
            if j.is_interrupted_start() {
                let last = j.stages.last().map_or("nothing", Stage::label);
                report
                    .warnings
                    .push(format!("unwinding an interrupted start (last completed: {last})"));
            }
        }
        let mut registry = journal
            .as_ref()
            .map(|j| j.processes.clone())
            .unwrap_or_default();

        match self.status.clear() {
            Ok(true) => report.record_cleared = true,
            Ok(false) => report.warnings.push("no session record present".to_string()),
            Err(err) => report.warnings.push(format!("cannot remove session record: {err}")),
        }

        let services = self.services();
        let portal_root = journal.as_ref().and_then(|j| j.portal_root.clone());
        services.stop_portal(&mut registry, portal_root.as_deref(), &mut report.warnings);
        services.stop_time_service(&mut registry, &mut report.warnings);
        services.stop_dhcp_dns(&mut registry, &mut report.warnings);

        if let Err(err) = self.host.firewall.flush_all() {
            report.warnings.push(format!("firewall flush failed: {err}"));
        }
        if let Err(err) = self.host.link.set_ip_forwarding(false) {
            report.warnings.push(format!("cannot disable forwarding: {err}"));
        }

        let ap_pattern = self.cfg.hostapd_conf_path().display().to_string();
        services.stop_process(
            ServiceKind::ApDaemon,
            registry.take(ServiceKind::ApDaemon),
            &ap_pattern,
            &mut report.warnings,
        );

        let ism = self.interface(None);
        let reset_failure = if options.hard_reset {
            ism.reset_hard().err()
        } else {
            if let Err(err) = ism.reset_soft() {
                report.warnings.push(format!("soft reset failed: {err}"));
            }
            None
        };

        let suspended = journal.as_ref().map(|j| j.suspended).unwrap_or_default();
        if let Err(err) = self.coordinator().restore(suspended) {
            report.warnings.push(format!("cannot restore network manager: {err}"));
        }

        let mut files = journal.map(|j| j.files).unwrap_or_default();
        files.push(self.cfg.hostapd_conf_path());
        files.push(self.cfg.dnsmasq_conf_path());
        for file in files {
            if let Err(err) = fsutil::remove_if_exists(&file) {
                report.warnings.push(format!("cannot remove {}: {err}", file.display()));
            }
        }
        if let Err(err) = SessionJournal::remove(&journal_path) {
            report.warnings.push(format!("cannot remove journal: {err}"));
        }

        for note in &report.warnings {
            warn!(target: TARGET, "{note}");
        }
        if let Some(err) = reset_failure {
            error!(target: TARGET, "hard reset failed: {err}");
            return Err(err);
        }
        info!(target: TARGET, warnings = report.warnings.len(), "access point stopped");
        Ok(report)
    }
}
