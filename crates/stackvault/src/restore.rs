//! Chain replay onto the live instance.
//!
//! Every link is downloaded and checked before anything on the destination
//! changes. Only then is the stack stopped and the chain applied oldest
//! first, with the newest dump replayed once at the end.

use std::path::{Path, PathBuf};

use crate::archiver::{archive_path, extract_archive};
use crate::catalog::{Catalog, CatalogEntry};
use crate::config::{DirKind, RestoreOptions, Settings, TrackedDir};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::fsutil::{clear_dir_contents, copy_file, ensure_dir};
use crate::manifest::{COMPOSE_COPY, ENV_COPY, STATUS_FAIL, is_snapshot_name};
use crate::remote::RemoteStore;
use crate::stack::Stack;
use crate::staging;
use crate::verify::{find_dump, verify_checksums};

#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub target: String,
    pub chain: Vec<String>,
    pub dump_replayed: Option<String>,
    pub config_replaced: bool,
    pub started: bool,
    pub healthy: bool,
    pub warnings: Vec<String>,
}

pub struct Restorer<'a> {
    settings: &'a Settings,
    remote: &'a dyn RemoteStore,
    db: &'a dyn Database,
    stack: &'a dyn Stack,
}

struct Downloaded {
    entry: CatalogEntry,
    dir: PathBuf,
}

impl<'a> Restorer<'a> {
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

    /// Restore `target`, or the newest snapshot of either tier.
    pub fn restore(&self, target: Option<&str>, options: RestoreOptions) -> Result<RestoreReport> {
        let catalog = Catalog::load(
            self.remote,
            &self.settings.remote.standard_path,
            &self.settings.remote.archive_path,
        )?;
        let target = match target {
            Some(name) => {
                if !is_snapshot_name(name) {
                    return Err(Error::usage(format!(
                        "'{name}' is not a snapshot name (expected YYYY-MM-DD_HH-MM-SS)"
                    )));
                }
                name.to_string()
            }
            None => catalog
                .latest()
                .map(|e| e.name.clone())
                .ok_or_else(|| Error::not_found("no snapshots found"))?,
        };
        let chain = catalog.resolve_chain(&target)?;
        tracing::info!(
            "restoring {target} via {}",
            chain
                .iter()
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        self.apply_chain(&catalog, &chain, options)
    }

    pub fn apply_chain(
        &self,
        catalog: &Catalog,
        chain: &[CatalogEntry],
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let Some(last) = chain.last() else {
            return Err(Error::usage("empty restore chain"));
        };
        let mut report = RestoreReport {
            target: last.name.clone(),
            chain: chain.iter().map(|e| e.name.clone()).collect(),
            ..RestoreReport::default()
        };

        let scratch = staging::create(&self.settings.staging_parent, staging::RESTORE_PREFIX)?;
        let links = self.download_all(catalog, chain, scratch.path(), &mut report)?;

        self.stack
            .stop()
            .map_err(|e| e.context("stopping stack before restore"))?;

        let mut final_dump = None::<(String, PathBuf)>;
        for (i, link) in links.iter().enumerate() {
            tracing::info!("applying {} ({})", link.entry.name, link.entry.mode_label());
            if i == 0 {
                report.config_replaced =
                    self.restore_config(&link.dir, options, &mut report.warnings)?;
                self.reset_dirs(options)?;
            }
            self.extract_dirs(&link.dir, options)?;
            if let Some(dump) = find_dump(&link.dir) {
                final_dump = Some((link.entry.name.clone(), dump));
            }
        }

        if let Some((from, dump)) = &final_dump {
            tracing::info!("replaying database dump from {from}");
            self.db
                .restore(dump)
                .map_err(|e| e.context(format!("replaying dump from {from}")))?;
            report.dump_replayed = Some(from.clone());
        } else {
            let msg = "no database dump in chain; database left untouched".to_string();
            tracing::warn!("{msg}");
            report.warnings.push(msg);
        }

        match self.stack.start() {
            Ok(()) => report.started = true,
            Err(e) => {
                let msg = format!("services not started: {e}");
                tracing::warn!("{msg}");
                report.warnings.push(msg);
            }
        }
        if report.started {
            match self.stack.health_check() {
                Ok(()) => report.healthy = true,
                Err(e) => {
                    let msg = format!("restore complete, but health check failed: {e}");
                    tracing::warn!("{msg}");
                    report.warnings.push(msg);
                }
            }
        }
        Ok(report)
    }

    fn download_all(
        &self,
        catalog: &Catalog,
        chain: &[CatalogEntry],
        scratch: &Path,
        report: &mut RestoreReport,
    ) -> Result<Vec<Downloaded>> {
        let mut links = Vec::with_capacity(chain.len());
        for (i, entry) in chain.iter().enumerate() {
            let dir = scratch.join(format!("{i:03}-{}", entry.name));
            ensure_dir(&dir)?;
            let path = catalog.path_of(entry);
            tracing::info!("downloading {}", self.remote.describe(&path));
            self.remote
                .download_dir(&path, &dir)
                .map_err(|e| e.context(format!("download of {}", entry.name)))?;
            if !verify_checksums(&dir).map_err(|e| e.context(entry.name.as_str()))? {
                let msg = format!("{}: no checksum file, contents not verified", entry.name);
                tracing::warn!("{msg}");
                report.warnings.push(msg);
            }
            if dir.join(STATUS_FAIL).is_file() {
                let msg = format!("{}: snapshot failed verification when written", entry.name);
                tracing::warn!("{msg}");
                report.warnings.push(msg);
            }
            links.push(Downloaded {
                entry: entry.clone(),
                dir,
            });
        }
        Ok(links)
    }

    fn restore_config(
        &self,
        link: &Path,
        options: RestoreOptions,
        warnings: &mut Vec<String>,
    ) -> Result<bool> {
        if options.keep_config {
            tracing::info!("keeping destination configuration files");
            return Ok(false);
        }
        let mut replaced = false;
        for (name, dest) in [
            (ENV_COPY, &self.settings.env_file),
            (COMPOSE_COPY, &self.settings.compose_file),
        ] {
            let src = link.join(name);
            if !src.is_file() {
                let msg = format!("snapshot has no {name}; keeping {}", dest.display());
                tracing::warn!("{msg}");
                warnings.push(msg);
                continue;
            }
            copy_file(&src, dest)?;
            replaced = true;
        }
        Ok(replaced)
    }

    fn skips(&self, tracked: &TrackedDir, options: RestoreOptions) -> bool {
        tracked.kind == DirKind::Config && options.keep_config && !options.restore_config_dirs
    }

    /// Empty every restorable tracked directory, whether or not the chain
    /// carries an archive for it, so no live state survives the restore.
    fn reset_dirs(&self, options: RestoreOptions) -> Result<()> {
        for tracked in &self.settings.dirs {
            if self.skips(tracked, options) {
                tracing::debug!("keeping {} (instance configuration)", tracked.name);
                continue;
            }
            clear_dir_contents(&tracked.path)?;
        }
        Ok(())
    }

    fn extract_dirs(&self, link: &Path, options: RestoreOptions) -> Result<()> {
        for tracked in &self.settings.dirs {
            if self.skips(tracked, options) {
                continue;
            }
            let archive = archive_path(link, &tracked.name);
            if !archive.is_file() {
                continue;
            }
            tracing::info!("extracting {} into {}", tracked.name, tracked.path.display());
            extract_archive(&archive, &tracked.path)?;
        }
        Ok(())
    }
}
