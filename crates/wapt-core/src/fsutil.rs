use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Result, WaptError};

/// Replaces `path` with `data` via a temp file, fsync and rename, so readers
/// only ever see the old or the new content.
pub(crate) fn write_atomic(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| WaptError::io(format!("creating {}", parent.display()), e))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    let mut options = fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options
        .open(tmp_path)
        .map_err(|e| WaptError::io(format!("opening {}", tmp_path.display()), e))?;
    file.write_all(data)
        .map_err(|e| WaptError::io(format!("writing {}", tmp_path.display()), e))?;
    file.sync_all()
        .map_err(|e| WaptError::io(format!("syncing {}", tmp_path.display()), e))?;

    fs::rename(tmp_path, path).map_err(|e| {
        WaptError::io(
            format!("renaming {} -> {}", tmp_path.display(), path.display()),
            e,
        )
    })
}

/// Removes a file, treating "already gone" as success. Returns whether a
/// file was actually removed.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(WaptError::io(format!("removing {}", path.display()), err)),
    }
}
