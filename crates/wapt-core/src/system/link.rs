use std::fs;
use std::path::PathBuf;

use ipnet::Ipv4Net;

use super::run_cmd;
use crate::config::WaptConfig;
use crate::error::{Result, WaptError};
use crate::interface::OperationalMode;
use crate::mac::MacAddr;

/// Direct operations on a network link and its driver.
pub trait LinkOps: Send + Sync {
    fn admin_is_up(&self, interface: &str) -> Result<bool>;
    fn set_admin(&self, interface: &str, up: bool) -> Result<()>;
    fn flush_addresses(&self, interface: &str) -> Result<()>;
    fn add_address(&self, interface: &str, address: Ipv4Net) -> Result<()>;

    fn mode(&self, interface: &str) -> Result<OperationalMode>;
    fn set_mode(&self, interface: &str, mode: &OperationalMode) -> Result<()>;

    fn hardware_address(&self, interface: &str) -> Result<MacAddr>;
    /// `None` when the driver does not expose a permanent address.
    fn factory_address(&self, interface: &str) -> Result<Option<MacAddr>>;
    fn set_hardware_address(&self, interface: &str, mac: MacAddr) -> Result<()>;

    fn device_present(&self, interface: &str) -> bool;
    fn driver_module(&self, interface: &str) -> Result<Option<String>>;
    fn module_loaded(&self, module: &str) -> bool;
    fn unload_module(&self, module: &str) -> Result<()>;
    fn load_module(&self, module: &str) -> Result<()>;

    fn set_ip_forwarding(&self, enabled: bool) -> Result<()>;
    fn station_dump(&self, interface: &str) -> Result<String>;
}

/// `ip`, `iw`, `ethtool` and `modprobe`, plus sysfs reads.
pub struct RealLinkOps {
    sys_class_net: PathBuf,
    sys_module: PathBuf,
    ip_forward_path: PathBuf,
}

impl RealLinkOps {
    pub fn new(cfg: &WaptConfig) -> Self {
        Self {
            sys_class_net: cfg.sys_class_net.clone(),
            sys_module: cfg.sys_module.clone(),
            ip_forward_path: cfg.ip_forward_path.clone(),
        }
    }
}

impl LinkOps for RealLinkOps {
    fn admin_is_up(&self, interface: &str) -> Result<bool> {
        let out = run_cmd("ip", &["link", "show", "dev", interface])?;
        parse_admin_up(&out.stdout)
            .ok_or_else(|| WaptError::parse("ip link output", format!("no flag list for {interface}")))
    }

    fn set_admin(&self, interface: &str, up: bool) -> Result<()> {
        let state = if up { "up" } else { "down" };
        run_cmd("ip", &["link", "set", "dev", interface, state]).map(|_| ())
    }

    fn flush_addresses(&self, interface: &str) -> Result<()> {
        run_cmd("ip", &["addr", "flush", "dev", interface]).map(|_| ())
    }

    fn add_address(&self, interface: &str, address: Ipv4Net) -> Result<()> {
        let cidr = address.to_string();
        run_cmd("ip", &["addr", "add", &cidr, "dev", interface]).map(|_| ())
    }

    fn mode(&self, interface: &str) -> Result<OperationalMode> {
        let out = run_cmd("iw", &["dev", interface, "info"])?;
        parse_iw_mode(&out.stdout)
            .ok_or_else(|| WaptError::parse("iw info output", format!("no type line for {interface}")))
    }

    fn set_mode(&self, interface: &str, mode: &OperationalMode) -> Result<()> {
        run_cmd("iw", &["dev", interface, "set", "type", mode.iw_type()]).map(|_| ())
    }

    fn hardware_address(&self, interface: &str) -> Result<MacAddr> {
        let path = self.sys_class_net.join(interface).join("address");
        let raw = fs::read_to_string(&path)
            .map_err(|e| WaptError::io(format!("reading {}", path.display()), e))?;
        raw.trim().parse()
    }

    fn factory_address(&self, interface: &str) -> Result<Option<MacAddr>> {
        let out = run_cmd("ethtool", &["-P", interface])?;
        Ok(parse_permanent_address(&out.stdout))
    }

    fn set_hardware_address(&self, interface: &str, mac: MacAddr) -> Result<()> {
        let mac = mac.to_string();
        run_cmd("ip", &["link", "set", "dev", interface, "address", &mac]).map(|_| ())
    }

    fn device_present(&self, interface: &str) -> bool {
        self.sys_class_net.join(interface).exists()
    }

    fn driver_module(&self, interface: &str) -> Result<Option<String>> {
        let link = self
            .sys_class_net
            .join(interface)
            .join("device")
            .join("driver")
            .join("module");
        match fs::read_link(&link) {
            Ok(target) => Ok(target
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WaptError::io(format!("resolving {}", link.display()), err)),
        }
    }

    fn module_loaded(&self, module: &str) -> bool {
        self.sys_module.join(module).exists()
    }

    fn unload_module(&self, module: &str) -> Result<()> {
        run_cmd("modprobe", &["-r", module]).map(|_| ())
    }

    fn load_module(&self, module: &str) -> Result<()> {
        run_cmd("modprobe", &[module]).map(|_| ())
    }

    fn set_ip_forwarding(&self, enabled: bool) -> Result<()> {
        let value = if enabled { "1\n" } else { "0\n" };
        fs::write(&self.ip_forward_path, value).map_err(|e| {
            WaptError::io(format!("writing {}", self.ip_forward_path.display()), e)
        })
    }

    fn station_dump(&self, interface: &str) -> Result<String> {
        run_cmd("iw", &["dev", interface, "station", "dump"]).map(|out| out.stdout)
    }
}

/// Reads the admin flag from `ip link show` output: the `UP` token inside
/// the `<...>` flag list. `LOWER_UP` alone means carrier, not admin state.
pub fn parse_admin_up(output: &str) -> Option<bool> {
    let start = output.find('<')?;
    let end = start + output[start..].find('>')?;
    let flags = &output[start + 1..end];
    Some(flags.split(',').any(|flag| flag == "UP"))
}

/// Reads `type <mode>` from `iw dev <if> info`.
pub fn parse_iw_mode(output: &str) -> Option<OperationalMode> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("type ")?;
        Some(OperationalMode::from_iw_type(rest.trim()))
    })
}

/// Reads `Permanent address: xx:..` from `ethtool -P`. An all-zero address
/// means the driver has none.
pub fn parse_permanent_address(output: &str) -> Option<MacAddr> {
    let (_, value) = output.trim().split_once(':')?;
    let mac: MacAddr = value.trim().parse().ok()?;
    if mac.is_zero() {
        None
    } else {
        Some(mac)
    }
}
