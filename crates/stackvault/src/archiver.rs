//! Per-directory archives built with GNU tar's listed-incremental mode.
//!
//! Each tracked directory `<name>` produces `<name>.tar.gz` plus the change
//! state `<name>.snar` in the staging directory. A full run starts from an
//! empty state file; an incremental run starts from the parent's state file,
//! which the writer fetched into staging beforehand.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::exec::{command_summary, run_command_output, run_with_input};
use crate::fsutil::clear_dir_or_file;
use crate::manifest::{ARCHIVE_SUFFIX, Mode, TOKEN_SUFFIX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived {
        archive: PathBuf,
        /// tar reported files changing while they were read.
        changed_during_read: bool,
    },
    Skipped,
}

pub fn archive_path(staging: &Path, name: &str) -> PathBuf {
    staging.join(format!("{name}{ARCHIVE_SUFFIX}"))
}

pub fn token_path(staging: &Path, name: &str) -> PathBuf {
    staging.join(format!("{name}{TOKEN_SUFFIX}"))
}

pub fn archive_dir(src: &Path, name: &str, staging: &Path, mode: Mode) -> Result<ArchiveOutcome> {
    if !src.is_dir() {
        tracing::warn!("{} does not exist; skipping '{name}'", src.display());
        return Ok(ArchiveOutcome::Skipped);
    }

    let archive = archive_path(staging, name);
    let token = token_path(staging, name);
    if mode.is_self_contained() {
        clear_dir_or_file(&token)?;
    } else if !token.is_file() {
        tracing::warn!(
            "no change-state token for '{name}' in parent; archiving everything"
        );
    }

    let mut cmd = Command::new("tar");
    cmd.arg(format!("--listed-incremental={}", token.display()))
        .arg("-czf")
        .arg(&archive)
        .arg("-C")
        .arg(src)
        .arg(".")
        .stdin(Stdio::null());
    tracing::info!("archiving {} -> {}", src.display(), archive.display());
    let out = cmd
        .output()
        .map_err(|e| Error::msg(format!("failed to spawn tar: {e}")))?;

    match out.status.code() {
        Some(0) => Ok(ArchiveOutcome::Archived {
            archive,
            changed_during_read: false,
        }),
        // GNU tar: 1 means "some files differ", the archive is still complete.
        Some(1) if archive.is_file() => {
            tracing::warn!(
                "tar reported changes while reading {}: {}",
                src.display(),
                command_summary(&out)
            );
            Ok(ArchiveOutcome::Archived {
                archive,
                changed_during_read: true,
            })
        }
        _ => {
            let _ = clear_dir_or_file(&archive);
            Err(Error::msg(format!(
                "failed to archive {} ({}): {}",
                src.display(),
                out.status,
                command_summary(&out)
            )))
        }
    }
}

/// Extract one chain link's archive into `dest`. Incremental archives also
/// remove files that were deleted since the previous link.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let mut cmd = Command::new("tar");
    cmd.arg("--listed-incremental=/dev/null")
        .arg("-xpzf")
        .arg(archive)
        .arg("-C")
        .arg(dest);
    let out = run_command_output(&mut cmd)?;
    if out.status.success() {
        return Ok(());
    }
    Err(Error::msg(format!(
        "failed to extract {} into {}: {}",
        archive.display(),
        dest.display(),
        command_summary(&out)
    )))
}

/// Read every member of an archive without extracting it.
pub fn test_archive(archive: &Path, timeout: Option<Duration>) -> Result<()> {
    let mut cmd = Command::new("tar");
    cmd.arg("-tzf").arg(archive);
    run_with_input(cmd, Box::new(std::io::empty()), timeout)
        .map_err(|e| Error::msg(format!("{} cannot be listed: {e}", archive.display())))
}
