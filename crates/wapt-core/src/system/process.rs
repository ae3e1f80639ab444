//! Background process supervision over `/proc` and `kill(2)`.

use std::fs;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::{Result, WaptError};

pub trait ProcessSupervisor: Send + Sync {
    /// Starts `program` detached in its own process group and returns its PID.
    fn spawn(&self, program: &str, args: &[String]) -> Result<i32>;
    fn is_alive(&self, pid: i32) -> bool;
    /// PIDs whose name or command line contains `pattern`.
    fn find(&self, pattern: &str) -> Result<Vec<i32>>;
    fn terminate(&self, pid: i32) -> Result<()>;
}

pub struct ProcfsSupervisor {
    proc_root: PathBuf,
}

impl ProcfsSupervisor {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    fn read_cmdline(&self, pid: i32) -> Option<String> {
        let raw = fs::read(self.proc_root.join(pid.to_string()).join("cmdline")).ok()?;
        let text = String::from_utf8_lossy(&raw)
            .split('\0')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Some(text)
    }

    fn read_comm(&self, pid: i32) -> Option<String> {
        fs::read_to_string(self.proc_root.join(pid.to_string()).join("comm"))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

impl Default for ProcfsSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor for ProcfsSupervisor {
    fn spawn(&self, program: &str, args: &[String]) -> Result<i32> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| WaptError::daemon_start(program, format!("spawn failed: {e}")))?;
        i32::try_from(child.id())
            .map_err(|_| WaptError::daemon_start(program, "PID does not fit in i32"))
    }

    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        let stat = match fs::read_to_string(self.proc_root.join(pid.to_string()).join("stat")) {
            Ok(stat) => stat,
            Err(_) => return false,
        };
        // Zombies still have a /proc entry; the state follows the comm field.
        match parse_stat_state(&stat) {
            Some(state) => state != 'Z' && state != 'X',
            None => false,
        }
    }

    fn find(&self, pattern: &str) -> Result<Vec<i32>> {
        if pattern.is_empty() {
            return Err(WaptError::parse("process pattern", "pattern cannot be empty"));
        }
        let entries = fs::read_dir(&self.proc_root)
            .map_err(|e| WaptError::io(format!("reading {}", self.proc_root.display()), e))?;

        let me = std::process::id() as i32;
        let mut matches = Vec::new();
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            if pid == me {
                continue;
            }
            let name_hit = self.read_comm(pid).is_some_and(|c| c.contains(pattern));
            let cmd_hit = self.read_cmdline(pid).is_some_and(|c| c.contains(pattern));
            if name_hit || cmd_hit {
                matches.push(pid);
            }
        }
        matches.sort_unstable();
        Ok(matches)
    }

    fn terminate(&self, pid: i32) -> Result<()> {
        if pid <= 0 {
            return Err(WaptError::parse("pid", format!("refusing to signal pid {pid}")));
        }
        // SAFETY: kill(2) has no memory-safety preconditions; pid is a
        // positive value so it never targets a process group.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(WaptError::io(format!("signalling pid {pid}"), err))
    }
}

fn parse_stat_state(stat: &str) -> Option<char> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.trim_start().chars().next()
}
