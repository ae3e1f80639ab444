use std::env;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WaptError};
use crate::retry::RetryPolicy;

pub const DEFAULT_ROOT_PATH: &str = "/opt/wapt";
pub const CONFIG_FILENAME: &str = "wapt.json";

/// Everything the core needs to know about the host. Relative paths are
/// resolved against the root directory at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaptConfig {
    pub interface: String,
    pub egress_interface: String,
    /// Gateway address and prefix of the AP subnet.
    pub gateway: Ipv4Net,
    pub lease_time: String,
    pub upstream_dns: Vec<Ipv4Addr>,

    pub run_dir: PathBuf,
    pub status_path: PathBuf,
    pub profiles_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub portal_assets_dir: PathBuf,
    pub portal_root: PathBuf,
    /// Captive portal server argv. `{gateway}` and `{root}` are substituted.
    pub http_command: Vec<String>,

    pub hostapd_bin: String,
    pub dnsmasq_bin: String,
    pub driver: String,

    pub network_manager_unit: String,
    pub supplicant_process: String,
    pub time_service_unit: String,

    pub sys_class_net: PathBuf,
    pub sys_module: PathBuf,
    pub ip_forward_path: PathBuf,
    pub resolv_conf: PathBuf,
    pub resolv_conf_target: PathBuf,

    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub poll_backoff: f64,
    pub poll_max_interval_ms: u64,
    pub device_attempts: u32,
    pub device_interval_ms: u64,
    pub settle_ms: u64,
    pub soft_reset_settle_ms: u64,
    pub daemon_startup_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 10,
            poll_interval_ms: 500,
            poll_backoff: 1.0,
            poll_max_interval_ms: 2000,
            device_attempts: 20,
            device_interval_ms: 500,
            settle_ms: 1000,
            soft_reset_settle_ms: 3000,
            daemon_startup_ms: 1500,
        }
    }
}

impl Default for WaptConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".into(),
            egress_interface: "eth0".into(),
            gateway: Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 1), 24)
                .unwrap_or_else(|_| Ipv4Net::from(Ipv4Addr::new(10, 0, 0, 1))),
            lease_time: "12h".into(),
            upstream_dns: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],

            run_dir: PathBuf::from("/tmp/wapt"),
            status_path: PathBuf::from("/tmp/ap_active"),
            profiles_dir: PathBuf::from("profiles"),
            templates_dir: PathBuf::from("templates"),
            portal_assets_dir: PathBuf::from("portal"),
            portal_root: PathBuf::from("/var/www/wapt"),
            http_command: [
                "python3",
                "-m",
                "http.server",
                "80",
                "--bind",
                "{gateway}",
                "--directory",
                "{root}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),

            hostapd_bin: "hostapd".into(),
            dnsmasq_bin: "dnsmasq".into(),
            driver: "nl80211".into(),

            network_manager_unit: "NetworkManager".into(),
            supplicant_process: "wpa_supplicant".into(),
            time_service_unit: "chrony".into(),

            sys_class_net: PathBuf::from("/sys/class/net"),
            sys_module: PathBuf::from("/sys/module"),
            ip_forward_path: PathBuf::from("/proc/sys/net/ipv4/ip_forward"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            resolv_conf_target: PathBuf::from("/run/systemd/resolve/stub-resolv.conf"),

            timing: TimingConfig::default(),
        }
    }
}

impl WaptConfig {
    /// Defaults, then `<root>/config/wapt.json`, then `WAPT_*` overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config").join(CONFIG_FILENAME);
        let mut cfg = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<WaptConfig>(&text)
                .map_err(|e| WaptError::Config(format!("{}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("no {} found, using defaults", path.display());
                WaptConfig::default()
            }
            Err(err) => return Err(WaptError::io(format!("reading {}", path.display()), err)),
        };

        cfg.apply_env()?;
        cfg.resolve_paths(root);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("WAPT_INTERFACE") {
            self.interface = v;
        }
        if let Ok(v) = env::var("WAPT_EGRESS") {
            self.egress_interface = v;
        }
        if let Ok(v) = env::var("WAPT_GATEWAY") {
            self.gateway = v
                .parse()
                .map_err(|e| WaptError::Config(format!("WAPT_GATEWAY '{v}': {e}")))?;
        }
        if let Ok(v) = env::var("WAPT_RUN_DIR") {
            self.run_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("WAPT_STATUS_PATH") {
            self.status_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<u32>("WAPT_POLL_ATTEMPTS") {
            self.timing.poll_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("WAPT_POLL_INTERVAL_MS") {
            self.timing.poll_interval_ms = v;
        }
        if let Ok(v) = env::var("WAPT_NM_UNIT") {
            self.network_manager_unit = v;
        }
        if let Ok(v) = env::var("WAPT_TIME_UNIT") {
            self.time_service_unit = v;
        }
        Ok(())
    }

    fn resolve_paths(&mut self, root: &Path) {
        for path in [
            &mut self.profiles_dir,
            &mut self.templates_dir,
            &mut self.portal_assets_dir,
        ] {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            return Err(WaptError::Config("interface is empty".into()));
        }
        if self.interface == self.egress_interface {
            return Err(WaptError::Config(format!(
                "AP interface and egress interface are both '{}'",
                self.interface
            )));
        }
        if self.gateway.prefix_len() > 24 {
            return Err(WaptError::Config(format!(
                "gateway subnet {} is too small for the DHCP range (needs /24 or larger)",
                self.gateway
            )));
        }
        if self.http_command.is_empty() {
            return Err(WaptError::Config("http_command is empty".into()));
        }
        Ok(())
    }

    pub fn admin_poll(&self) -> RetryPolicy {
        let t = &self.timing;
        RetryPolicy::fixed(t.poll_attempts, Duration::from_millis(t.poll_interval_ms))
            .with_backoff(t.poll_backoff, Duration::from_millis(t.poll_max_interval_ms))
    }

    pub fn device_poll(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.timing.device_attempts,
            Duration::from_millis(self.timing.device_interval_ms),
        )
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.timing.settle_ms)
    }

    pub fn soft_reset_settle(&self) -> Duration {
        Duration::from_millis(self.timing.soft_reset_settle_ms)
    }

    pub fn daemon_grace(&self) -> Duration {
        Duration::from_millis(self.timing.daemon_startup_ms)
    }

    pub fn hostapd_conf_path(&self) -> PathBuf {
        self.run_dir.join("hostapd.conf")
    }

    pub fn dnsmasq_conf_path(&self) -> PathBuf {
        self.run_dir.join("dnsmasq.conf")
    }

    pub fn leases_path(&self) -> PathBuf {
        self.run_dir.join("dnsmasq.leases")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.run_dir.join("session.json")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}='{raw}': not a valid number");
            None
        }
    }
}

/// Root directory: explicit argument, then `WAPT_ROOT`, then
/// `/opt/wapt` if it exists, then the current directory.
pub fn resolve_root(input: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = input {
        return Ok(path);
    }

    if let Ok(env_path) = env::var("WAPT_ROOT") {
        return Ok(PathBuf::from(env_path));
    }

    let default = PathBuf::from(DEFAULT_ROOT_PATH);
    if default.exists() {
        return Ok(default);
    }

    env::current_dir().map_err(|e| WaptError::io("determining current directory", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "WAPT_INTERFACE",
        "WAPT_EGRESS",
        "WAPT_GATEWAY",
        "WAPT_RUN_DIR",
        "WAPT_STATUS_PATH",
        "WAPT_POLL_ATTEMPTS",
        "WAPT_POLL_INTERVAL_MS",
        "WAPT_NM_UNIT",
        "WAPT_TIME_UNIT",
        "WAPT_ROOT",
    ];

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in KEYS {
                guard.remove(key);
            }
            guard
        }

        fn remember(&mut self, key: &str) {
            if !self.vars.iter().any(|(k, _)| k == key) {
                self.vars.push((key.to_string(), env::var(key).ok()));
            }
        }

        fn set(&mut self, key: &str, value: &str) {
            self.remember(key);
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            self.remember(key);
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..) {
                match value {
                    Some(val) => env::set_var(&key, val),
                    None => env::remove_var(&key),
                }
            }
        }
    }

    #[test]
    fn defaults_resolve_relative_paths_against_root() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new();
        let root = tempfile::tempdir().unwrap();

        let cfg = WaptConfig::load(root.path()).unwrap();
        assert_eq!(cfg.interface, "wlan0");
        assert_eq!(cfg.gateway.addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(cfg.profiles_dir, root.path().join("profiles"));
        assert_eq!(cfg.status_path, PathBuf::from("/tmp/ap_active"));
        assert_eq!(cfg.admin_poll().attempts, 10);
        assert_eq!(cfg.journal_path(), PathBuf::from("/tmp/wapt/session.json"));
    }

    #[test]
    fn file_then_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let mut guard = EnvGuard::new();
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("config")).unwrap();
        fs::write(
            root.path().join("config").join(CONFIG_FILENAME),
            r#"{"interface":"wlan1","egress_interface":"usb0","timing":{"poll_attempts":3}}"#,
        )
        .unwrap();
        guard.set("WAPT_EGRESS", "eth1");
        guard.set("WAPT_GATEWAY", "192.168.50.1/24");
        guard.set("WAPT_POLL_INTERVAL_MS", "not-a-number");

        let cfg = WaptConfig::load(root.path()).unwrap();
        assert_eq!(cfg.interface, "wlan1");
        assert_eq!(cfg.egress_interface, "eth1");
        assert_eq!(cfg.gateway.to_string(), "192.168.50.1/24");
        assert_eq!(cfg.timing.poll_attempts, 3);
        assert_eq!(cfg.timing.poll_interval_ms, 500);
        assert_eq!(cfg.timing.device_attempts, 20);
    }

    #[test]
    fn rejects_bad_gateway_and_tiny_subnets() {
        let _lock = ENV_LOCK.lock().unwrap();
        let mut guard = EnvGuard::new();
        let root = tempfile::tempdir().unwrap();

        guard.set("WAPT_GATEWAY", "10.0.0.1");
        assert!(matches!(
            WaptConfig::load(root.path()),
            Err(WaptError::Config(_))
        ));

        guard.set("WAPT_GATEWAY", "10.0.0.1/30");
        assert!(matches!(
            WaptConfig::load(root.path()),
            Err(WaptError::Config(_))
        ));
    }

    #[test]
    fn resolve_root_prefers_argument_then_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WAPT_ROOT", "/srv/wapt");
        assert_eq!(
            resolve_root(Some(PathBuf::from("/explicit"))).unwrap(),
            PathBuf::from("/explicit")
        );
        assert_eq!(resolve_root(None).unwrap(), PathBuf::from("/srv/wapt"));
    }
}
