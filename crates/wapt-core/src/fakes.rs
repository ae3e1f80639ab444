//! Simulated host for tests. One shared state behind all four system
//! traits, so a test can drive the pipelines and then inspect the result.
//!
//! Mutations that the interface state machine must never make on an
//! admin-up device are recorded in `violations` rather than rejected, so a
//! test can assert none happened.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ipnet::Ipv4Net;
use tempfile::TempDir;

use crate::config::{TimingConfig, WaptConfig};
use crate::error::{Result, WaptError};
use crate::interface::{InterfaceMachine, OperationalMode};
use crate::mac::MacAddr;
use crate::manager::ManagerCoordinator;
use crate::services::ServiceCoordinator;
use crate::session::SessionOrchestrator;
use crate::system::{Firewall, Host, LinkOps, ProcessSupervisor, Rule, UnitControl};

#[derive(Debug, Clone)]
pub(crate) struct FakeProc {
    pub cmdline: String,
    pub alive: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeState {
    pub admin_up: bool,
    /// Reads after a `set_admin` that still report the old state.
    pub admin_lag: u32,
    pub admin_stuck: bool,
    pending_admin: Option<(bool, u32)>,
    pub admin_toggles: u32,
    pub mode: OperationalMode,
    pub addresses: Vec<Ipv4Net>,
    pub current_mac: MacAddr,
    pub factory_mac: MacAddr,
    pub violations: Vec<String>,

    pub device_present: bool,
    pub device_returns: bool,
    pub driver: Option<String>,
    pub loaded_modules: Vec<String>,
    /// (dependent, base)
    pub dependents: Vec<(String, String)>,
    pub module_log: Vec<String>,
    pub ip_forward: bool,
    pub stations: String,

    pub manager_active: bool,
    pub active_units: Vec<String>,
    pub unit_restarts: u32,
    pub fail_unit_restart: bool,

    pub processes: BTreeMap<i32, FakeProc>,
    next_pid: i32,
    pub spawned: Vec<(String, Vec<String>)>,
    /// Programs that exit right after being spawned.
    pub fail_spawn: Vec<String>,
    pub supplicant_pids: Vec<i32>,

    pub rules: Vec<String>,
    /// Inserts fail once this many rules are present.
    pub fail_rule_after: Option<usize>,
    /// Inserts succeed but never show up in the listing.
    pub drop_rules: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        let factory: MacAddr = MacAddr([0xb8, 0x27, 0xeb, 0x12, 0x34, 0x56]);
        Self {
            admin_up: true,
            admin_lag: 0,
            admin_stuck: false,
            pending_admin: None,
            admin_toggles: 0,
            mode: OperationalMode::Managed,
            addresses: Vec::new(),
            current_mac: factory,
            factory_mac: factory,
            violations: Vec::new(),

            device_present: true,
            device_returns: true,
            driver: Some("brcmfmac".into()),
            loaded_modules: vec!["brcmfmac".into()],
            dependents: vec![
                ("iwlmvm".into(), "iwlwifi".into()),
                ("iwldvm".into(), "iwlwifi".into()),
                ("brcmfmac_wcc".into(), "brcmfmac".into()),
            ],
            module_log: Vec::new(),
            ip_forward: false,
            stations: String::new(),

            manager_active: true,
            active_units: Vec::new(),
            unit_restarts: 0,
            fail_unit_restart: false,

            processes: BTreeMap::new(),
            next_pid: 1000,
            spawned: Vec::new(),
            fail_spawn: Vec::new(),
            supplicant_pids: Vec::new(),

            rules: Vec::new(),
            fail_rule_after: None,
            drop_rules: false,
        }
    }
}

impl FakeState {
    pub fn alive_pids(&self) -> Vec<i32> {
        self.processes
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(pid, _)| *pid)
            .collect()
    }

    fn guard_quiesced(&mut self, what: &str) {
        if self.admin_up {
            self.violations.push(format!("{what} while admin up"));
        }
    }

    fn require_device(&self) -> Result<()> {
        if self.device_present {
            Ok(())
        } else {
            Err(WaptError::command("ip link show", "Device does not exist"))
        }
    }
}

struct FakeSystem {
    state: Arc<Mutex<FakeState>>,
    manager_unit: String,
    supplicant: String,
}

impl FakeSystem {
    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LinkOps for FakeSystem {
    fn admin_is_up(&self, _interface: &str) -> Result<bool> {
        let mut s = self.lock();
        s.require_device()?;
        if let Some((target, remaining)) = s.pending_admin {
            if s.admin_stuck {
                return Ok(s.admin_up);
            }
            if remaining == 0 {
                s.admin_up = target;
                s.pending_admin = None;
            } else {
                s.pending_admin = Some((target, remaining - 1));
            }
        }
        Ok(s.admin_up)
    }

    fn set_admin(&self, _interface: &str, up: bool) -> Result<()> {
        let mut s = self.lock();
        s.require_device()?;
        s.admin_toggles += 1;
        let lag = s.admin_lag;
        s.pending_admin = Some((up, lag));
        Ok(())
    }

    fn flush_addresses(&self, _interface: &str) -> Result<()> {
        let mut s = self.lock();
        s.guard_quiesced("flush addresses");
        s.addresses.clear();
        Ok(())
    }

    fn add_address(&self, _interface: &str, address: Ipv4Net) -> Result<()> {
        let mut s = self.lock();
        s.guard_quiesced("add address");
        if !s.addresses.contains(&address) {
            s.addresses.push(address);
        }
        Ok(())
    }

    fn mode(&self, _interface: &str) -> Result<OperationalMode> {
        let s = self.lock();
        s.require_device()?;
        Ok(s.mode.clone())
    }

    fn set_mode(&self, _interface: &str, mode: &OperationalMode) -> Result<()> {
        let mut s = self.lock();
        s.guard_quiesced("set mode");
        s.mode = mode.clone();
        Ok(())
    }

    fn hardware_address(&self, _interface: &str) -> Result<MacAddr> {
        let s = self.lock();
        s.require_device()?;
        Ok(s.current_mac)
    }

    fn factory_address(&self, _interface: &str) -> Result<Option<MacAddr>> {
        Ok(Some(self.lock().factory_mac))
    }

    fn set_hardware_address(&self, _interface: &str, mac: MacAddr) -> Result<()> {
        let mut s = self.lock();
        s.guard_quiesced("set hardware address");
        s.current_mac = mac;
        Ok(())
    }

    fn device_present(&self, _interface: &str) -> bool {
        self.lock().device_present
    }

    fn driver_module(&self, _interface: &str) -> Result<Option<String>> {
        Ok(self.lock().driver.clone())
    }

    fn module_loaded(&self, module: &str) -> bool {
        self.lock().loaded_modules.iter().any(|m| m == module)
    }

    fn unload_module(&self, module: &str) -> Result<()> {
        let mut s = self.lock();
        let blocker = s
            .dependents
            .iter()
            .find(|(dep, base)| base == module && s.loaded_modules.contains(dep))
            .map(|(dep, _)| dep.clone());
        if let Some(dep) = blocker {
            return Err(WaptError::command(
                format!("modprobe -r {module}"),
                format!("Module {module} is in use by {dep}"),
            ));
        }
        s.loaded_modules.retain(|m| m != module);
        s.module_log.push(format!("-{module}"));
        if s.driver.as_deref() == Some(module) {
            s.device_present = false;
            s.admin_up = false;
            s.pending_admin = None;
        }
        Ok(())
    }

    fn load_module(&self, module: &str) -> Result<()> {
        let mut s = self.lock();
        if !s.loaded_modules.iter().any(|m| m == module) {
            s.loaded_modules.push(module.to_string());
        }
        s.module_log.push(format!("+{module}"));
        let deps: Vec<String> = s
            .dependents
            .iter()
            .filter(|(_, base)| base == module)
            .map(|(dep, _)| dep.clone())
            .collect();
        for dep in deps {
            if !s.loaded_modules.contains(&dep) {
                s.loaded_modules.push(dep);
            }
        }
        if s.driver.as_deref() == Some(module) && s.device_returns {
            s.device_present = true;
            s.admin_up = false;
            s.mode = OperationalMode::Managed;
            s.current_mac = s.factory_mac;
            s.addresses.clear();
        }
        Ok(())
    }

    fn set_ip_forwarding(&self, enabled: bool) -> Result<()> {
        self.lock().ip_forward = enabled;
        Ok(())
    }

    fn station_dump(&self, _interface: &str) -> Result<String> {
        Ok(self.lock().stations.clone())
    }
}

impl UnitControl for FakeSystem {
    fn is_active(&self, unit: &str) -> Result<bool> {
        let s = self.lock();
        if unit == self.manager_unit {
            Ok(s.manager_active)
        } else {
            Ok(s.active_units.iter().any(|u| u == unit))
        }
    }

    fn start(&self, unit: &str) -> Result<()> {
        let mut s = self.lock();
        if unit == self.manager_unit {
            s.manager_active = true;
        } else if !s.active_units.iter().any(|u| u == unit) {
            s.active_units.push(unit.to_string());
        }
        Ok(())
    }

    fn stop(&self, unit: &str) -> Result<()> {
        let mut s = self.lock();
        if unit == self.manager_unit {
            s.manager_active = false;
        } else {
            s.active_units.retain(|u| u != unit);
        }
        Ok(())
    }

    fn restart(&self, unit: &str) -> Result<()> {
        {
            let mut s = self.lock();
            if s.fail_unit_restart {
                return Err(WaptError::command(format!("systemctl restart {unit}"), "unit failed"));
            }
            s.unit_restarts += 1;
        }
        self.start(unit)
    }

    fn main_pid(&self, unit: &str) -> Result<Option<i32>> {
        Ok(self.is_active(unit)?.then_some(4242))
    }
}

impl ProcessSupervisor for FakeSystem {
    fn spawn(&self, program: &str, args: &[String]) -> Result<i32> {
        let mut s = self.lock();
        let pid = s.next_pid;
        s.next_pid += 1;
        let alive = !s.fail_spawn.iter().any(|p| p == program);
        let mut cmdline = program.to_string();
        for arg in args {
            cmdline.push(' ');
            cmdline.push_str(arg);
        }
        s.processes.insert(pid, FakeProc { cmdline, alive });
        s.spawned.push((program.to_string(), args.to_vec()));
        if alive && program == "hostapd" {
            s.mode = OperationalMode::Ap;
        }
        Ok(pid)
    }

    fn is_alive(&self, pid: i32) -> bool {
        self.lock().processes.get(&pid).is_some_and(|p| p.alive)
    }

    fn find(&self, pattern: &str) -> Result<Vec<i32>> {
        let s = self.lock();
        if pattern == self.supplicant {
            return Ok(s.supplicant_pids.clone());
        }
        Ok(s
            .processes
            .iter()
            .filter(|(_, p)| p.alive && p.cmdline.contains(pattern))
            .map(|(pid, _)| *pid)
            .collect())
    }

    fn terminate(&self, pid: i32) -> Result<()> {
        let mut s = self.lock();
        s.supplicant_pids.retain(|p| *p != pid);
        if let Some(p) = s.processes.get_mut(&pid) {
            p.alive = false;
        }
        Ok(())
    }
}

impl Firewall for FakeSystem {
    fn insert(&self, rule: &Rule) -> Result<()> {
        let mut s = self.lock();
        if let Some(limit) = s.fail_rule_after {
            if s.rules.len() >= limit {
                return Err(WaptError::Firewall {
                    rule: rule.to_string(),
                    reason: "iptables: No chain/target/match by that name.".into(),
                });
            }
        }
        if !s.drop_rules {
            s.rules.push(rule.listed());
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        self.lock().rules.clear();
        Ok(())
    }

    fn list_rules(&self) -> Result<Vec<String>> {
        Ok(self.lock().rules.clone())
    }
}

/// Config with every path under `dir` and every delay zeroed.
pub(crate) fn test_config(dir: &Path) -> WaptConfig {
    WaptConfig {
        run_dir: dir.join("run"),
        status_path: dir.join("ap_active"),
        profiles_dir: dir.join("profiles"),
        templates_dir: dir.join("templates"),
        portal_assets_dir: dir.join("portal"),
        portal_root: dir.join("www"),
        ip_forward_path: dir.join("ip_forward"),
        resolv_conf: dir.join("resolv.conf"),
        resolv_conf_target: dir.join("stub-resolv.conf"),
        sys_class_net: dir.join("sys_class_net"),
        sys_module: dir.join("sys_module"),
        timing: TimingConfig {
            poll_attempts: 3,
            poll_interval_ms: 0,
            poll_backoff: 1.0,
            poll_max_interval_ms: 0,
            device_attempts: 5,
            device_interval_ms: 0,
            settle_ms: 0,
            soft_reset_settle_ms: 0,
            daemon_startup_ms: 0,
        },
        ..WaptConfig::default()
    }
}

pub(crate) struct FakeHost {
    system: Arc<FakeSystem>,
    cfg: WaptConfig,
    dir: TempDir,
}

impl FakeHost {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let system = Arc::new(FakeSystem {
            state: Arc::new(Mutex::new(FakeState::default())),
            manager_unit: cfg.network_manager_unit.clone(),
            supplicant: cfg.supplicant_process.clone(),
        });
        Self {
            system,
            cfg,
            dir,
        }
    }

    pub fn with_state(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.system.lock());
    }

    /// Snapshot; never holds the lock past the call.
    pub fn state(&self) -> FakeState {
        self.system.lock().clone()
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> &WaptConfig {
        &self.cfg
    }

    pub fn host(&self) -> Host {
        Host {
            link: self.system.clone(),
            units: self.system.clone(),
            procs: self.system.clone(),
            firewall: self.system.clone(),
        }
    }

    pub fn procs(&self) -> Arc<dyn ProcessSupervisor> {
        self.system.clone()
    }

    pub fn machine(&self) -> InterfaceMachine {
        InterfaceMachine::new(
            self.cfg.interface.clone(),
            self.system.clone(),
            self.system.clone(),
            self.cfg.network_manager_unit.clone(),
        )
        .with_timing(
            self.cfg.admin_poll(),
            self.cfg.device_poll(),
            self.cfg.soft_reset_settle(),
        )
    }

    pub fn coordinator(&self) -> ManagerCoordinator {
        ManagerCoordinator::new(
            self.system.clone(),
            self.system.clone(),
            self.cfg.network_manager_unit.clone(),
            self.cfg.supplicant_process.clone(),
            self.cfg.settle(),
        )
    }

    pub fn services(&self) -> ServiceCoordinator<'_> {
        ServiceCoordinator::new(&self.cfg, self.system.clone(), self.system.clone())
    }

    pub fn orchestrator(&self) -> SessionOrchestrator {
        SessionOrchestrator::new(self.cfg.clone(), self.host())
    }

    pub fn write_profile(&self, name: &str, json: &str) {
        fs::create_dir_all(&self.cfg.profiles_dir).unwrap();
        fs::write(self.cfg.profiles_dir.join(format!("{name}.json")), json).unwrap();
    }

    pub fn seed_portal_assets(&self) {
        let css = self.cfg.portal_assets_dir.join("css");
        fs::create_dir_all(&css).unwrap();
        fs::write(self.cfg.portal_assets_dir.join("index.html"), "<h1>Lab</h1>").unwrap();
        fs::write(css.join("site.css"), "body{}").unwrap();
    }
}
