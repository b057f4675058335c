//! One backup run: stage, verify, upload, prune.

use chrono::{DateTime, Utc};

use crate::archiver::{ArchiveOutcome, archive_dir};
use crate::catalog::{Tier, list_snapshots};
use crate::config::Settings;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::fsutil::{atomic_write_text, copy_file};
use crate::manifest::{
    COMPOSE_COPY, DUMP_FILE, ENV_COPY, Lineage, MANIFEST_FILE, Manifest, Mode, TOKEN_SUFFIX,
    snapshot_name,
};
use crate::remote::{RemoteStore, join};
use crate::retention::{RetentionReport, apply_retention};
use crate::stack::Stack;
use crate::staging;
use crate::verify::{VerifyReport, verify_staging, write_checksums, write_status};

#[derive(Debug, Clone)]
pub struct WriteReport {
    pub name: String,
    pub requested: Mode,
    pub mode: Mode,
    pub parent: Option<String>,
    pub remote_path: String,
    pub archives: Vec<String>,
    pub verify: VerifyReport,
    /// Degraded-but-uploaded conditions (missing directory, failed dump...).
    pub warnings: Vec<String>,
    pub retention: Option<RetentionReport>,
}

impl WriteReport {
    pub fn verified(&self) -> bool {
        self.verify.passed()
    }
}

pub struct Writer<'a> {
    settings: &'a Settings,
    remote: &'a dyn RemoteStore,
    db: &'a dyn Database,
    stack: &'a dyn Stack,
}

impl<'a> Writer<'a> {
    pub fn new(
        settings: &'a Settings,
        remote: &'a dyn RemoteStore,
        db: &'a dyn Database,
        stack: &'a dyn Stack,
    ) -> Self {
        Self {
            settings,
            remote,
            db,
            stack,
        }
    }

    pub fn write_snapshot(&self, mode: Mode) -> Result<WriteReport> {
        self.write_snapshot_at(mode, Utc::now())
    }

    pub fn write_snapshot_at(&self, requested: Mode, now: DateTime<Utc>) -> Result<WriteReport> {
        let remote_cfg = &self.settings.remote;
        let name = snapshot_name(now);
        let mut warnings = Vec::<String>::new();

        let standard = list_snapshots(self.remote, &remote_cfg.standard_path, Tier::Standard)?;
        let (mode, parent) = match requested {
            Mode::Incremental => match standard.iter().max_by(|a, b| a.name.cmp(&b.name)) {
                None => {
                    tracing::info!("no previous snapshot; running a full backup instead");
                    (Mode::Full, None)
                }
                Some(p) if p.manifest.is_none() => {
                    let msg = format!(
                        "latest snapshot {} has no readable manifest; running a full backup",
                        p.name
                    );
                    tracing::warn!("{msg}");
                    warnings.push(msg);
                    (Mode::Full, None)
                }
                Some(p) => (Mode::Incremental, Some(p.name.clone())),
            },
            other => (other, None),
        };

        let root = match mode {
            Mode::Archive => &remote_cfg.archive_path,
            _ => &remote_cfg.standard_path,
        };
        let remote_path = join(root, &name);
        let existing = match mode {
            Mode::Archive => list_snapshots(self.remote, root, Tier::Archive)?
                .into_iter()
                .map(|e| e.name)
                .collect::<Vec<_>>(),
            _ => standard.iter().map(|e| e.name.clone()).collect(),
        };
        if existing.iter().any(|n| *n == name) {
            return Err(Error::msg(format!(
                "snapshot {} already exists",
                self.remote.describe(&remote_path)
            )));
        }

        tracing::info!(
            "starting {mode} snapshot {name}{}",
            parent
                .as_deref()
                .map(|p| format!(" (parent {p})"))
                .unwrap_or_default()
        );
        let stage = staging::create(&self.settings.staging_parent, staging::BACKUP_PREFIX)?;
        let dir = stage.path();

        if let Some(p) = &parent {
            let parent_path = join(&remote_cfg.standard_path, p);
            if let Err(e) = self.remote.download_matching(&parent_path, TOKEN_SUFFIX, dir) {
                let msg = format!("could not fetch change-state tokens from {p}: {e}");
                tracing::warn!("{msg}");
                warnings.push(msg);
            }
        }

        if let Err(e) = self.db.dump(&dir.join(DUMP_FILE)) {
            let msg = format!("database dump failed: {e}");
            tracing::warn!("{msg}");
            warnings.push(msg);
        }

        let mut archives = Vec::new();
        for tracked in &self.settings.dirs {
            match archive_dir(&tracked.path, &tracked.name, dir, mode)
                .map_err(|e| e.context(format!("snapshot {name}")))?
            {
                ArchiveOutcome::Archived {
                    changed_during_read,
                    ..
                } => {
                    if changed_during_read {
                        warnings.push(format!("{}: files changed while archiving", tracked.name));
                    }
                    archives.push(tracked.name.clone());
                }
                ArchiveOutcome::Skipped => {
                    warnings.push(format!("{}: directory missing, skipped", tracked.name));
                }
            }
        }

        self.copy_config(dir, &mut warnings);
        if let Err(e) = self.stack.capture_images(dir) {
            let msg = format!("could not record image versions: {e}");
            tracing::warn!("{msg}");
            warnings.push(msg);
        }

        let lineage = match (&mode, &parent) {
            (Mode::Incremental, Some(p)) => Lineage::Incremental { parent: p.clone() },
            (Mode::Archive, _) => Lineage::Archive,
            _ => Lineage::Full,
        };
        atomic_write_text(&dir.join(MANIFEST_FILE), &Manifest::new(lineage, now).render())?;
        write_checksums(dir)?;

        let verify = verify_staging(dir, self.db, Some(self.settings.database.load_timeout))?;
        write_status(dir, &verify, Utc::now())?;
        if verify.passed() {
            tracing::info!(
                "verification passed ({} archives, dump checked: {})",
                verify.archives_checked,
                verify.dump_checked
            );
        } else {
            tracing::warn!("verification failed: {}", verify.failures.join("; "));
        }

        tracing::info!("uploading to {}", self.remote.describe(&remote_path));
        self.remote
            .upload_dir(dir, &remote_path)
            .map_err(|e| e.context(format!("upload of {name}")))?;
        tracing::info!("uploaded {name}");

        let retention = if mode == Mode::Archive {
            None
        } else {
            match apply_retention(
                self.remote,
                &remote_cfg.standard_path,
                &remote_cfg.archive_path,
                &self.settings.retention,
                now,
            ) {
                Ok(r) => Some(r),
                Err(e) => {
                    let msg = format!("retention failed: {e}");
                    tracing::warn!("{msg}");
                    warnings.push(msg);
                    None
                }
            }
        };

        Ok(WriteReport {
            name,
            requested,
            mode,
            parent,
            remote_path,
            archives,
            verify,
            warnings,
            retention,
        })
    }

    fn copy_config(&self, dir: &std::path::Path, warnings: &mut Vec<String>) {
        for (src, dest) in [
            (&self.settings.env_file, ENV_COPY),
            (&self.settings.compose_file, COMPOSE_COPY),
        ] {
            if !src.is_file() {
                let msg = format!("{} not found; not included", src.display());
                tracing::warn!("{msg}");
                warnings.push(msg);
                continue;
            }
            if let Err(e) = copy_file(src, &dir.join(dest)) {
                tracing::warn!("{e}");
                warnings.push(e.to_string());
            }
        }
    }
}
