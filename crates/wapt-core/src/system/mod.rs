//! Seams between the pipelines and the host. Each trait covers one external
//! concern; the real implementations shell out or read sysfs/procfs, and
//! tests swap in a simulated host.

pub mod firewall;
pub mod link;
pub mod process;
pub mod units;

use std::process::Command;
use std::sync::Arc;

use crate::config::WaptConfig;
use crate::error::{Result, WaptError};

pub use firewall::{nat_rules, Firewall, IptablesFirewall, Rule};
pub use link::{LinkOps, RealLinkOps};
pub use process::{ProcessSupervisor, ProcfsSupervisor};
pub use units::{Systemctl, UnitControl};

#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

fn describe(cmd: &str, args: &[&str]) -> String {
    if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{cmd} {}", args.join(" "))
    }
}

/// Runs a command to completion. A non-zero exit is an error carrying the
/// tool's stderr.
pub fn run_cmd(cmd: &str, args: &[&str]) -> Result<CmdOutput> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| WaptError::command(describe(cmd, args), e.to_string()))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        let reason = match stderr.trim() {
            "" => format!("exit status {}", output.status),
            msg => msg.to_string(),
        };
        return Err(WaptError::command(describe(cmd, args), reason));
    }
    Ok(CmdOutput { stdout, stderr })
}

/// Runs a command and only reports whether it exited zero. For probes such
/// as `systemctl is-active` where failure is an answer, not an error.
pub fn run_status(cmd: &str, args: &[&str]) -> Result<bool> {
    Command::new(cmd)
        .args(args)
        .output()
        .map(|o| o.status.success())
        .map_err(|e| WaptError::command(describe(cmd, args), e.to_string()))
}

/// The four host seams bundled for the orchestrator.
#[derive(Clone)]
pub struct Host {
    pub link: Arc<dyn LinkOps>,
    pub units: Arc<dyn UnitControl>,
    pub procs: Arc<dyn ProcessSupervisor>,
    pub firewall: Arc<dyn Firewall>,
}

impl Host {
    pub fn real(cfg: &WaptConfig) -> Self {
        Self {
            link: Arc::new(RealLinkOps::new(cfg)),
            units: Arc::new(Systemctl),
            procs: Arc::new(ProcfsSupervisor::new()),
            firewall: Arc::new(IptablesFirewall::new()),
        }
    }
}
