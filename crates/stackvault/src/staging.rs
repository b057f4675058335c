//! Scratch directories for backup staging and restore downloads.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use crate::error::{Error, Result};
use crate::fsutil::{clear_dir_or_file, ensure_dir};

pub const BACKUP_PREFIX: &str = "stackvault-backup.";
pub const RESTORE_PREFIX: &str = "stackvault-restore.";

/// Leftovers younger than this may belong to a run that is still going.
pub const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Create a scratch directory that is removed when the handle drops.
pub fn create(parent: &Path, prefix: &str) -> Result<TempDir> {
    ensure_dir(parent)?;
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .map_err(|e| {
            Error::msg(format!(
                "failed to create scratch dir in {}: {e}",
                parent.display()
            ))
        })
}

/// Remove scratch directories left behind by killed runs. Returns how many
/// were removed.
pub fn sweep_stale(parent: &Path, older_than: Duration) -> Result<usize> {
    let entries = match fs::read_dir(parent) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(Error::msg(format!(
                "failed to read {}: {e}",
                parent.display()
            )));
        }
    };
    let now = SystemTime::now();
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !(name.starts_with(BACKUP_PREFIX) || name.starts_with(RESTORE_PREFIX)) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_dir() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }
        match clear_dir_or_file(&entry.path()) {
            Ok(()) => {
                tracing::info!("removed stale scratch dir {}", entry.path().display());
                removed += 1;
            }
            Err(e) => tracing::warn!("{e}"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_dir_is_removed_on_drop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = {
            let dir = create(tmp.path(), BACKUP_PREFIX).expect("create");
            fs::write(dir.path().join("postgres.sql"), "x").expect("write");
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn sweep_only_touches_our_prefixes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("stackvault-backup.abc123")).expect("mkdir");
        fs::create_dir_all(tmp.path().join("stackvault-restore.def456/sub")).expect("mkdir");
        fs::create_dir_all(tmp.path().join("unrelated")).expect("mkdir");
        let n = sweep_stale(tmp.path(), Duration::ZERO).expect("sweep");
        assert_eq!(n, 2);
        assert!(tmp.path().join("unrelated").is_dir());
    }

    #[test]
    fn sweep_spares_recent_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("stackvault-backup.live")).expect("mkdir");
        assert_eq!(sweep_stale(tmp.path(), STALE_AFTER).expect("sweep"), 0);
    }
}
