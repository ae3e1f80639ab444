use super::{run_cmd, run_status};
use crate::error::{Result, WaptError};

/// Service manager control for the units the core coordinates with.
pub trait UnitControl: Send + Sync {
    fn is_active(&self, unit: &str) -> Result<bool>;
    fn start(&self, unit: &str) -> Result<()>;
    fn stop(&self, unit: &str) -> Result<()>;
    fn restart(&self, unit: &str) -> Result<()>;
    /// `None` when the unit has no running main process.
    fn main_pid(&self, unit: &str) -> Result<Option<i32>>;
}

pub struct Systemctl;

impl UnitControl for Systemctl {
    fn is_active(&self, unit: &str) -> Result<bool> {
        run_status("systemctl", &["is-active", "--quiet", unit])
    }

    fn start(&self, unit: &str) -> Result<()> {
        run_cmd("systemctl", &["start", unit]).map(|_| ())
    }

    fn stop(&self, unit: &str) -> Result<()> {
        run_cmd("systemctl", &["stop", unit]).map(|_| ())
    }

    fn restart(&self, unit: &str) -> Result<()> {
        run_cmd("systemctl", &["restart", unit]).map(|_| ())
    }

    fn main_pid(&self, unit: &str) -> Result<Option<i32>> {
        let out = run_cmd("systemctl", &["show", "-p", "MainPID", "--value", unit])?;
        parse_main_pid(&out.stdout)
    }
}

fn parse_main_pid(raw: &str) -> Result<Option<i32>> {
    let pid = raw
        .trim()
        .parse::<i32>()
        .map_err(|e| WaptError::parse("systemctl MainPID", e.to_string()))?;
    Ok((pid > 0).then_some(pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_pid_zero_means_not_running() {
        assert_eq!(parse_main_pid("0\n").unwrap(), None);
        assert_eq!(parse_main_pid("812\n").unwrap(), Some(812));
        assert!(parse_main_pid("").is_err());
    }
}
