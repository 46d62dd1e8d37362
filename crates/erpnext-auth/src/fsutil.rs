//! Atomic, owner-only file writes for the key and token files

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Write `contents` to `path` atomically with mode 0600.
///
/// Writes a temp file in the same directory, then renames it over the
/// target, so readers never observe a half-written file. Permissions are
/// applied on every write because external tools may have changed them.
pub(crate) async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io(format!("{} has no parent directory", path.display())))?;
    if !dir.as_os_str().is_empty() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("secret");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));
    let mut tmp = TempFile::new(&tmp_path);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(&tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating {}: {e}", tmp_path.display())))?;
    file.write_all(contents)
        .await
        .map_err(|e| Error::Io(format!("writing {}: {e}", tmp_path.display())))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing {}: {e}", tmp_path.display())))?;
    drop(file);

    // A stale temp file from a crashed run keeps its old mode; reset it.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| Error::Io(format!("setting permissions on {}: {e}", tmp_path.display())))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming {} into place: {e}", tmp_path.display())))?;
    tmp.persisted();

    debug!(path = %path.display(), "wrote private file");
    Ok(())
}

/// Removes a temp file on drop unless it was renamed into place. Covers
/// both error returns and a write abandoned mid-way (dropped future).
struct TempFile<'a> {
    path: &'a Path,
    persisted: bool,
}

impl<'a> TempFile<'a> {
    fn new(path: &'a Path) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn persisted(&mut self) {
        self.persisted = true;
    }
}

impl Drop for TempFile<'_> {
    fn drop(&mut self) {
        if !self.persisted {
            if let Err(e) = std::fs::remove_file(self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "could not remove temp file");
                }
            }
        }
    }
}
