use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::config::LoggingConfig;

struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Drops rotated logs older than `keep_days`, then trims oldest-first until
/// the directory fits under the size cap.
pub fn run_retention(root: &Path, cfg: &LoggingConfig) -> Result<()> {
    let mut entries = collect_log_files(&root.join("logs"))?;

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(cfg.keep_days.saturating_mul(24 * 60 * 60)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    entries.retain(|entry| {
        if entry.modified >= cutoff {
            return true;
        }
        match fs::remove_file(&entry.path) {
            Ok(()) => false,
            Err(err) => {
                tracing::warn!("Failed to remove old log {}: {}", entry.path.display(), err);
                true
            }
        }
    });

    let cap = cfg.max_total_bytes();
    let mut total_size: u64 = entries.iter().map(|e| e.size).sum();
    if total_size > cap {
        entries.sort_by_key(|e| e.modified);
        for entry in entries {
            if total_size <= cap {
                break;
            }
            if let Err(err) = fs::remove_file(&entry.path) {
                tracing::warn!(
                    "Failed to remove log {} during size cap cleanup: {}",
                    entry.path.display(),
                    err
                );
                continue;
            }
            total_size = total_size.saturating_sub(entry.size);
        }
    }

    Ok(())
}

fn collect_log_files(log_root: &Path) -> Result<Vec<LogFile>> {
    let mut files = Vec::new();
    if !log_root.exists() {
        return Ok(files);
    }

    let entries =
        fs::read_dir(log_root).with_context(|| format!("reading {}", log_root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("iterating {}", log_root.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !name.contains(".log") {
            continue;
        }

        let metadata = fs::metadata(&path).with_context(|| format!("stat {}", path.display()))?;
        files.push(LogFile {
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: metadata.len(),
            path,
        });
    }

    Ok(files)
}
