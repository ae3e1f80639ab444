//! Auxiliary daemons around the AP: DHCP/DNS, time service and the captive
//! portal HTTP server.
//!
//! Each is launched fire-and-forget and checked once for liveness. Stopping
//! never fails: anything already gone becomes a warning.

pub mod registry;

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::WaptConfig;
use crate::error::{Result, WaptError};
use crate::fsutil;
use crate::retry;
use crate::system::{ProcessSupervisor, UnitControl};

pub use registry::{ProcessRegistry, ServiceKind, ServiceProcessHandle};

pub(crate) use wapt_logging::targets::T_SERVICES as TARGET;

fn offset(net: Ipv4Net, host: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(net.network()) + host)
}

/// dnsmasq configuration serving the AP subnet.
pub fn render_dnsmasq_conf(cfg: &WaptConfig) -> String {
    let gw = cfg.gateway.addr();
    let mut conf = format!(
        "interface={iface}\n\
         bind-interfaces\n\
         listen-address={gw}\n\
         dhcp-range={start},{end},{mask},{lease}\n\
         dhcp-option=3,{gw}\n\
         dhcp-option=6,{gw}\n\
         dhcp-authoritative\n\
         dhcp-leasefile={leases}\n\
         no-resolv\n\
         no-poll\n\
         domain-needed\n\
         bogus-priv\n",
        iface = cfg.interface,
        start = offset(cfg.gateway, 10),
        end = offset(cfg.gateway, 200),
        mask = cfg.gateway.netmask(),
        lease = cfg.lease_time,
        leases = cfg.leases_path().display(),
    );
    for server in &cfg.upstream_dns {
        conf.push_str(&format!("server={server}\n"));
    }
    conf
}

pub struct ServiceCoordinator<'a> {
    cfg: &'a WaptConfig,
    procs: Arc<dyn ProcessSupervisor>,
    units: Arc<dyn UnitControl>,
}

impl<'a> ServiceCoordinator<'a> {
    pub fn new(
        cfg: &'a WaptConfig,
        procs: Arc<dyn ProcessSupervisor>,
        units: Arc<dyn UnitControl>,
    ) -> Self {
        Self { cfg, procs, units }
    }

    fn spawn_checked(&self, kind: ServiceKind, program: &str, args: &[String]) -> Result<ServiceProcessHandle> {
        let pid = self.procs.spawn(program, args)?;
        retry::settle(self.cfg.daemon_grace());
        let handle = ServiceProcessHandle::new(kind, pid);
        if !handle.is_alive(self.procs.as_ref()) {
            return Err(WaptError::daemon_start(
                program,
                format!("pid {pid} exited during startup"),
            ));
        }
        info!(target: TARGET, %kind, pid, "started");
        Ok(handle)
    }

    /// Fatal on failure: clients cannot get addresses without it.
    pub fn start_dhcp_dns(&self, registry: &mut ProcessRegistry) -> Result<()> {
        let conf_path = self.cfg.dnsmasq_conf_path();
        fsutil::write_atomic(&conf_path, render_dnsmasq_conf(self.cfg).as_bytes(), 0o644)?;

        let args = vec![
            "--keep-in-foreground".to_string(),
            format!("--conf-file={}", conf_path.display()),
        ];
        let handle = self.spawn_checked(ServiceKind::DhcpDnsDaemon, &self.cfg.dnsmasq_bin, &args)?;
        registry.insert(handle);
        Ok(())
    }

    /// Best effort. A unit that was already running belongs to the host and
    /// is not tracked, so stop leaves it alone.
    pub fn start_time_service(&self, registry: &mut ProcessRegistry) {
        let unit = &self.cfg.time_service_unit;
        if self.units.is_active(unit).unwrap_or(false) {
            info!(target: TARGET, %unit, "time service already running");
            return;
        }
        if let Err(err) = self.units.start(unit) {
            warn!(target: TARGET, %unit, "time service failed to start: {err}");
            return;
        }
        match self.units.main_pid(unit) {
            Ok(Some(pid)) => {
                registry.insert(ServiceProcessHandle::new(ServiceKind::TimeService, pid));
                info!(target: TARGET, %unit, pid, "time service started");
            }
            Ok(None) => warn!(target: TARGET, %unit, "time service started but reports no main pid"),
            Err(err) => warn!(target: TARGET, %unit, "cannot read main pid: {err}"),
        }
    }

    /// Deploys the portal assets and serves them. Returns the deployed root,
    /// or `None` when the portal could not be brought up; that is a warning,
    /// not a failed session.
    pub fn start_portal(&self, registry: &mut ProcessRegistry) -> Option<PathBuf> {
        let assets = &self.cfg.portal_assets_dir;
        if !assets.is_dir() {
            warn!(target: TARGET, dir = %assets.display(), "portal assets missing; skipping captive portal");
            return None;
        }
        let root = self.cfg.portal_root.clone();
        match deploy_assets(assets, &root) {
            Ok(copied) => info!(target: TARGET, copied, root = %root.display(), "portal assets deployed"),
            Err(err) => {
                warn!(target: TARGET, "portal deploy failed: {err}");
                remove_portal_root(&root);
                return None;
            }
        }

        let argv: Vec<String> = self
            .cfg
            .http_command
            .iter()
            .map(|arg| {
                arg.replace("{gateway}", &self.cfg.gateway.addr().to_string())
                    .replace("{root}", &root.display().to_string())
            })
            .collect();
        let Some((program, args)) = argv.split_first() else {
            warn!(target: TARGET, "http_command is empty; skipping captive portal");
            remove_portal_root(&root);
            return None;
        };

        match self.spawn_checked(ServiceKind::HttpServer, program, args) {
            Ok(handle) => {
                registry.insert(handle);
                Some(root)
            }
            Err(err) => {
                warn!(target: TARGET, "captive portal did not start: {err}");
                remove_portal_root(&root);
                None
            }
        }
    }

    pub(crate) fn stop_process(
        &self,
        kind: ServiceKind,
        handle: Option<ServiceProcessHandle>,
        pattern: &str,
        warnings: &mut Vec<String>,
    ) {
        let pids = match handle {
            Some(handle) if handle.is_alive(self.procs.as_ref()) => vec![handle.pid],
            Some(handle) => {
                warnings.push(format!("{kind} (pid {}) was not running", handle.pid));
                return;
            }
            None => self.procs.find(pattern).unwrap_or_default(),
        };
        if pids.is_empty() {
            warnings.push(format!("{kind} was not running"));
            return;
        }
        for pid in pids {
            match self.procs.terminate(pid) {
                Ok(()) => info!(target: TARGET, %kind, pid, "stopped"),
                Err(err) => warnings.push(format!("failed to stop {kind} (pid {pid}): {err}")),
            }
        }
    }

    pub fn stop_portal(
        &self,
        registry: &mut ProcessRegistry,
        deployed_root: Option<&Path>,
        warnings: &mut Vec<String>,
    ) {
        let root = deployed_root.unwrap_or(self.cfg.portal_root.as_path()).to_path_buf();
        let pattern = root.display().to_string();
        self.stop_process(
            ServiceKind::HttpServer,
            registry.take(ServiceKind::HttpServer),
            &pattern,
            warnings,
        );
        if root.exists() {
            remove_portal_root(&root);
        }
    }

    pub fn stop_time_service(&self, registry: &mut ProcessRegistry, warnings: &mut Vec<String>) {
        let unit = &self.cfg.time_service_unit;
        if registry.take(ServiceKind::TimeService).is_none() {
            info!(target: TARGET, %unit, "time service not started by this session; leaving it");
            return;
        }
        match self.units.stop(unit) {
            Ok(()) => info!(target: TARGET, %unit, "time service stopped"),
            Err(err) => warnings.push(format!("failed to stop {unit}: {err}")),
        }
    }

    /// Stops the daemon and puts the host resolver link back.
    pub fn stop_dhcp_dns(&self, registry: &mut ProcessRegistry, warnings: &mut Vec<String>) {
        let pattern = format!("--conf-file={}", self.cfg.dnsmasq_conf_path().display());
        self.stop_process(
            ServiceKind::DhcpDnsDaemon,
            registry.take(ServiceKind::DhcpDnsDaemon),
            &pattern,
            warnings,
        );
        if let Err(err) = self.restore_resolver() {
            warnings.push(format!("resolver not restored: {err}"));
        }
    }

    /// Points the resolver config back at the host's own symlink target.
    pub fn restore_resolver(&self) -> Result<()> {
        let link = &self.cfg.resolv_conf;
        let target = &self.cfg.resolv_conf_target;
        if fs::read_link(link).is_ok_and(|current| &current == target) {
            return Ok(());
        }
        if !target.exists() {
            return Err(WaptError::Config(format!(
                "resolver target {} does not exist",
                target.display()
            )));
        }

        fsutil::remove_if_exists(link)?;
        std::os::unix::fs::symlink(target, link)
            .map_err(|e| WaptError::io(format!("linking {} -> {}", link.display(), target.display()), e))?;
        info!(target: TARGET, link = %link.display(), target = %target.display(), "resolver restored");
        Ok(())
    }
}

fn deploy_assets(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| WaptError::parse("portal assets", e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| WaptError::parse("portal asset path", e.to_string()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| WaptError::io(format!("creating {}", target.display()), e))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)
                .map_err(|e| WaptError::io(format!("copying to {}", target.display()), e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn remove_portal_root(root: &Path) {
    match fs::remove_dir_all(root) {
        Ok(()) => info!(target: TARGET, root = %root.display(), "portal root removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(target: TARGET, root = %root.display(), "cannot remove portal root: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeHost;

    #[test]
    fn dnsmasq_conf_covers_the_ap_subnet() {
        let host = FakeHost::new();
        let conf = render_dnsmasq_conf(host.config());
        assert!(conf.contains("interface=wlan0\n"));
        assert!(conf.contains("listen-address=10.0.0.1\n"));
        assert!(conf.contains("dhcp-range=10.0.0.10,10.0.0.200,255.255.255.0,12h\n"));
        assert!(conf.contains("server=8.8.8.8\n"));
    }

    #[test]
    fn dhcp_start_registers_handle_and_detects_early_exit() {
        let host = FakeHost::new();
        let services = host.services();
        let mut reg = ProcessRegistry::default();
        services.start_dhcp_dns(&mut reg).unwrap();
        assert!(reg.get(ServiceKind::DhcpDnsDaemon).is_some());
        assert!(host.config().dnsmasq_conf_path().exists());

        host.with_state(|s| s.fail_spawn = vec!["dnsmasq".into()]);
        let mut reg = ProcessRegistry::default();
        let err = services.start_dhcp_dns(&mut reg).unwrap_err();
        assert!(matches!(err, WaptError::DaemonStart { .. }), "{err}");
    }

    #[test]
    fn portal_without_assets_is_a_soft_failure() {
        let host = FakeHost::new();
        let mut reg = ProcessRegistry::default();
        assert_eq!(host.services().start_portal(&mut reg), None);
        assert!(reg.get(ServiceKind::HttpServer).is_none());
    }

    #[test]
    fn portal_deploys_and_stop_removes_assets() {
        let host = FakeHost::new();
        host.seed_portal_assets();
        let services = host.services();
        let mut reg = ProcessRegistry::default();

        let root = services.start_portal(&mut reg).unwrap();
        assert!(root.join("index.html").exists());
        assert!(root.join("css").join("site.css").exists());
        let pid = reg.get(ServiceKind::HttpServer).unwrap().pid;
        assert_eq!(host.state().spawned.last().map(|s| s.0.clone()), Some("python3".into()));

        let mut warnings = Vec::new();
        services.stop_portal(&mut reg, Some(&root), &mut warnings);
        assert!(warnings.is_empty(), "{warnings:?}");
        assert!(!root.exists());
        assert!(!host.procs().is_alive(pid));
    }

    #[test]
    fn time_service_already_running_is_left_alone() {
        let host = FakeHost::new();
        host.with_state(|s| s.active_units.push("chrony".into()));
        let services = host.services();
        let mut reg = ProcessRegistry::default();
        services.start_time_service(&mut reg);
        assert!(reg.get(ServiceKind::TimeService).is_none());

        let mut warnings = Vec::new();
        services.stop_time_service(&mut reg, &mut warnings);
        assert!(host.state().active_units.contains(&"chrony".to_string()));
    }

    #[test]
    fn stopping_absent_daemons_only_warns() {
        let host = FakeHost::new();
        let services = host.services();
        let mut reg = ProcessRegistry::default();
        let mut warnings = Vec::new();
        services.stop_dhcp_dns(&mut reg, &mut warnings);
        services.stop_portal(&mut reg, None, &mut warnings);
        assert!(warnings.iter().any(|w| w.contains("DHCP/DNS daemon was not running")));
        assert!(warnings.iter().any(|w| w.contains("captive portal server was not running")));
    }

    #[test]
    fn resolver_is_relinked_to_host_target() {
        let host = FakeHost::new();
        let cfg = host.config();
        fs::write(&cfg.resolv_conf_target, "nameserver 127.0.0.53\n").unwrap();
        fs::write(&cfg.resolv_conf, "nameserver 10.0.0.1\n").unwrap();

        let services = host.services();
        services.restore_resolver().unwrap();
        assert_eq!(fs::read_link(&cfg.resolv_conf).unwrap(), cfg.resolv_conf_target);
        // Second call is a no-op.
        services.restore_resolver().unwrap();
    }
}
