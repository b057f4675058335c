//! Remote-derived snapshot catalog and chain resolution.
//!
//! Nothing here is cached: every load lists the remote and reads each
//! snapshot's manifest again.

use std::collections::HashSet;
use std::fmt;

use crate::error::{Error, ErrorKind, Result};
use crate::manifest::{
    IMAGES_JSON, IMAGES_TXT, MANIFEST_FILE, Manifest, Mode, STATUS_FAIL, STATUS_OK,
    is_snapshot_name,
};
use crate::remote::{RemoteSize, RemoteStore, join};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Standard,
    Archive,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Tier::Standard => "standard",
            Tier::Archive => "archive",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub tier: Tier,
    /// `None` when the manifest is missing or unreadable.
    pub manifest: Option<Manifest>,
}

impl CatalogEntry {
    pub fn mode(&self) -> Option<Mode> {
        self.manifest.as_ref().map(Manifest::mode)
    }

    pub fn parent(&self) -> Option<&str> {
        self.manifest.as_ref().and_then(Manifest::parent)
    }

    pub fn mode_label(&self) -> &'static str {
        self.mode().map(Mode::as_str).unwrap_or("?")
    }
}

/// List snapshot directories under `root`, oldest first.
pub fn list_snapshots(
    remote: &dyn RemoteStore,
    root: &str,
    tier: Tier,
) -> Result<Vec<CatalogEntry>> {
    let mut out = Vec::new();
    for name in remote.list_dirs(root)? {
        if !is_snapshot_name(&name) {
            continue;
        }
        let path = join(&join(root, &name), MANIFEST_FILE);
        let manifest = match remote.read_file(&path) {
            Ok(text) => match Manifest::parse(&text) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!("{name}: unreadable manifest: {e}");
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("{name}: no manifest");
                None
            }
            Err(e) => {
                tracing::warn!("{name}: failed to read manifest: {e}");
                None
            }
        };
        out.push(CatalogEntry {
            name,
            tier,
            manifest,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pub standard_root: String,
    pub archive_root: String,
    pub standard: Vec<CatalogEntry>,
    pub archive: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn load(remote: &dyn RemoteStore, standard_root: &str, archive_root: &str) -> Result<Self> {
        let standard = list_snapshots(remote, standard_root, Tier::Standard)?;
        let archive = list_snapshots(remote, archive_root, Tier::Archive)?;
        Ok(Self {
            standard_root: standard_root.to_string(),
            archive_root: archive_root.to_string(),
            standard,
            archive,
        })
    }

    pub fn from_entries(
        standard_root: &str,
        archive_root: &str,
        mut entries: Vec<CatalogEntry>,
    ) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let (standard, archive): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| e.tier == Tier::Standard);
        Self {
            standard_root: standard_root.to_string(),
            archive_root: archive_root.to_string(),
            standard,
            archive,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.standard.is_empty() && self.archive.is_empty()
    }

    /// All entries of both tiers, oldest first.
    pub fn entries(&self) -> Vec<&CatalogEntry> {
        let mut all: Vec<&CatalogEntry> = self.standard.iter().chain(self.archive.iter()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.standard
            .iter()
            .chain(self.archive.iter())
            .find(|e| e.name == name)
    }

    pub fn latest(&self) -> Option<&CatalogEntry> {
        self.standard
            .iter()
            .chain(self.archive.iter())
            .max_by(|a, b| a.name.cmp(&b.name))
    }

    pub fn latest_standard(&self) -> Option<&CatalogEntry> {
        self.standard.iter().max_by(|a, b| a.name.cmp(&b.name))
    }

    pub fn root_of(&self, tier: Tier) -> &str {
        match tier {
            Tier::Standard => &self.standard_root,
            Tier::Archive => &self.archive_root,
        }
    }

    pub fn path_of(&self, entry: &CatalogEntry) -> String {
        join(self.root_of(entry.tier), &entry.name)
    }

    /// Snapshots needed to rebuild `target`, oldest first. The first entry is
    /// always a full or archive snapshot and each later entry's parent is its
    /// predecessor.
    ///
    /// An incremental manifest without a parent is never taken as a chain
    /// root: it fails to parse, so the link has no readable manifest and the
    /// chain is `ChainCorrupt`.
    pub fn resolve_chain(&self, target: &str) -> Result<Vec<CatalogEntry>> {
        let mut current = self
            .get(target)
            .ok_or_else(|| Error::not_found(format!("snapshot '{target}' not found")))?;
        let mut seen = HashSet::<&str>::new();
        let mut chain = Vec::<CatalogEntry>::new();
        loop {
            if !seen.insert(current.name.as_str()) {
                return Err(Error::chain_corrupt(format!(
                    "cycle in chain of '{target}' at '{}'",
                    current.name
                )));
            }
            chain.push(current.clone());
            let Some(manifest) = &current.manifest else {
                return Err(Error::chain_corrupt(format!(
                    "'{}' in chain of '{target}' has no readable manifest",
                    current.name
                )));
            };
            match manifest.parent() {
                None => break,
                Some(parent) => {
                    current = self.get(parent).ok_or_else(|| {
                        Error::chain_corrupt(format!(
                            "'{}' references missing parent '{parent}'",
                            current.name
                        ))
                    })?;
                }
            }
        }
        chain.reverse();
        Ok(chain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMarker {
    Ok,
    Failed,
    Missing,
}

#[derive(Debug, Clone)]
pub struct SnapshotDetail {
    pub status: StatusMarker,
    pub has_images: bool,
    pub size: RemoteSize,
}

/// Status marker, image record and stored size of one snapshot.
pub fn describe(
    remote: &dyn RemoteStore,
    catalog: &Catalog,
    entry: &CatalogEntry,
) -> Result<SnapshotDetail> {
    let path = catalog.path_of(entry);
    let files = remote.list_files(&path)?;
    let has = |n: &str| files.iter().any(|f| f == n);
    let status = if has(STATUS_OK) {
        StatusMarker::Ok
    } else if has(STATUS_FAIL) {
        StatusMarker::Failed
    } else {
        StatusMarker::Missing
    };
    Ok(SnapshotDetail {
        status,
        has_images: has(IMAGES_JSON) || has(IMAGES_TXT),
        size: remote.size(&path)?,
    })
}

/// `1536` -> `1.5 KiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
