use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::archiver::test_archive;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::fsutil::{atomic_write_text, list_files, sha256_file};
use crate::manifest::{ARCHIVE_SUFFIX, DUMP_FILE, DUMP_FILE_GZ, STATUS_FAIL, STATUS_OK, SUMS_FILE};

#[derive(Debug, Default, Clone)]
pub struct VerifyReport {
    pub archives_checked: usize,
    pub dump_checked: bool,
    pub failures: Vec<String>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

pub fn find_dump(dir: &Path) -> Option<std::path::PathBuf> {
    [DUMP_FILE, DUMP_FILE_GZ]
        .iter()
        .map(|n| dir.join(n))
        .find(|p| p.is_file())
}

/// Check that every archive in `dir` lists cleanly and that the dump (if
/// any) loads into a scratch database.
pub fn verify_staging(
    dir: &Path,
    db: &dyn Database,
    timeout: Option<Duration>,
) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    for path in list_files(dir)? {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !name.ends_with(ARCHIVE_SUFFIX) {
            continue;
        }
        report.archives_checked += 1;
        if let Err(e) = test_archive(&path, timeout) {
            tracing::warn!("archive check failed: {e}");
            report.failures.push(format!("{name}: {e}"));
        }
    }

    if let Some(dump) = find_dump(dir) {
        report.dump_checked = true;
        tracing::info!("test-loading database dump into scratch instance");
        if let Err(e) = db.verify_dump(&dump) {
            tracing::warn!("database dump check failed: {e}");
            report.failures.push(format!("database: {e}"));
        }
    }
    Ok(report)
}

/// Write `status.ok` or `status.fail`, removing the other.
pub fn write_status(dir: &Path, report: &VerifyReport, now: DateTime<Utc>) -> Result<()> {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let (keep, drop) = if report.passed() {
        (STATUS_OK, STATUS_FAIL)
    } else {
        (STATUS_FAIL, STATUS_OK)
    };
    let mut body = format!("{stamp}\n");
    for f in &report.failures {
        body.push_str(f);
        body.push('\n');
    }
    let _ = fs::remove_file(dir.join(drop));
    atomic_write_text(&dir.join(keep), &body)
}

fn covered_by_sums(name: &str) -> bool {
    !matches!(name, SUMS_FILE | STATUS_OK | STATUS_FAIL)
}

/// `SHA256SUMS` in `sha256sum` format over the payload files.
pub fn write_checksums(dir: &Path) -> Result<()> {
    let mut body = String::new();
    for path in list_files(dir)? {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !covered_by_sums(&name) {
            continue;
        }
        body.push_str(&format!("{}  {name}\n", sha256_file(&path)?));
    }
    atomic_write_text(&dir.join(SUMS_FILE), &body)
}

/// Check a downloaded snapshot against its `SHA256SUMS`. Returns `false` when
/// the snapshot carries no checksum file.
pub fn verify_checksums(dir: &Path) -> Result<bool> {
    let sums = dir.join(SUMS_FILE);
    let text = match fs::read_to_string(&sums) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(Error::msg(format!("failed to read {}: {e}", sums.display())));
        }
    };
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let Some((want, name)) = line.split_once("  ") else {
            return Err(Error::msg(format!("malformed checksum line: {line}")));
        };
        let name = name.trim();
        if name.contains('/') || name.starts_with("..") {
            return Err(Error::msg(format!("unsafe checksum entry: {name}")));
        }
        let path = dir.join(name);
        if !path.is_file() {
            return Err(Error::msg(format!("{name} listed in {SUMS_FILE} is missing")));
        }
        let got = sha256_file(&path)?;
        if !got.eq_ignore_ascii_case(want.trim()) {
            return Err(Error::msg(format!("checksum mismatch for {name}")));
        }
    }
    Ok(true)
}
