use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::fsutil::{clear_dir_or_file, copy_file, copy_path, ensure_dir};

use super::{RemoteSize, RemoteStore};

/// A remote that is a plain directory (mounted share, external disk).
/// Uploads land in a hidden sibling first and are renamed into place.
pub struct LocalRemote {
    root: PathBuf,
}

impl LocalRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path.trim_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::usage(format!("invalid remote path '{path}'")));
        }
        Ok(self.root.join(rel))
    }

    fn entries(&self, path: &str, want_dirs: bool) -> Result<Vec<String>> {
        let dir = self.resolve(path)?;
        let rd = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::msg(format!("failed to list {}: {e}", dir.display())));
            }
        };
        let mut out = Vec::new();
        for entry in rd {
            let entry =
                entry.map_err(|e| Error::msg(format!("failed to list {}: {e}", dir.display())))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir == want_dirs {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }

    fn require_dir(&self, path: &str) -> Result<PathBuf> {
        let dir = self.resolve(path)?;
        if !dir.is_dir() {
            return Err(Error::not_found(format!(
                "remote directory not found: {}",
                dir.display()
            )));
        }
        Ok(dir)
    }
}

impl RemoteStore for LocalRemote {
    fn describe(&self, path: &str) -> String {
        self.root.join(path.trim_matches('/')).display().to_string()
    }

    fn list_dirs(&self, path: &str) -> Result<Vec<String>> {
        self.entries(path, true)
    }

    fn list_files(&self, path: &str) -> Result<Vec<String>> {
        self.entries(path, false)
    }

    fn read_file(&self, path: &str) -> Result<String> {
        let p = self.resolve(path)?;
        fs::read_to_string(&p).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("remote file not found: {}", p.display()))
            } else {
                Error::msg(format!("failed to read {}: {e}", p.display()))
            }
        })
    }

    fn upload_dir(&self, local: &Path, path: &str) -> Result<()> {
        let dest = self.resolve(path)?;
        if dest.exists() {
            // Same as `rclone copy` into an existing directory: merge.
            return copy_path(local, &dest);
        }
        let parent = dest
            .parent()
            .ok_or_else(|| Error::usage(format!("invalid remote path '{path}'")))?;
        ensure_dir(parent)?;
        let leaf = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = parent.join(format!(".{leaf}.partial.{}", std::process::id()));
        clear_dir_or_file(&partial)?;
        if let Err(e) = copy_path(local, &partial) {
            let _ = clear_dir_or_file(&partial);
            return Err(e);
        }
        fs::rename(&partial, &dest).map_err(|e| {
            let _ = clear_dir_or_file(&partial);
            Error::msg(format!(
                "failed to move {} into place at {}: {e}",
                partial.display(),
                dest.display()
            ))
        })
    }

    fn download_dir(&self, path: &str, local: &Path) -> Result<()> {
        let src = self.require_dir(path)?;
        copy_path(&src, local)
    }

    fn download_matching(&self, path: &str, suffix: &str, local: &Path) -> Result<()> {
        let src = self.require_dir(path)?;
        for name in self.list_files(path)? {
            if name.ends_with(suffix) {
                copy_file(&src.join(&name), &local.join(&name))?;
            }
        }
        Ok(())
    }

    fn purge(&self, path: &str) -> Result<()> {
        let p = self.require_dir(path)?;
        clear_dir_or_file(&p)
    }

    fn remove_empty_dirs(&self, path: &str) -> Result<()> {
        let top = self.resolve(path)?;
        if !top.is_dir() {
            return Ok(());
        }
        for entry in walkdir::WalkDir::new(&top).min_depth(1).contents_first(true) {
            let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let is_empty = fs::read_dir(entry.path())
                .map(|mut rd| rd.next().is_none())
                .unwrap_or(false);
            if is_empty {
                fs::remove_dir(entry.path()).map_err(|e| {
                    Error::msg(format!(
                        "failed to remove empty dir {}: {e}",
                        entry.path().display()
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn size(&self, path: &str) -> Result<RemoteSize> {
        let top = self.require_dir(path)?;
        let mut total = RemoteSize::default();
        for entry in walkdir::WalkDir::new(&top) {
            let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| {
                Error::msg(format!("failed to stat {}: {e}", entry.path().display()))
            })?;
            total.files += 1;
            total.bytes += meta.len();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn upload_then_list_and_read() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stage = tmp.path().join("stage");
        fs::create_dir_all(&stage).expect("mkdir");
        fs::write(stage.join("manifest.yaml"), "mode: full\n").expect("write");
        let r = LocalRemote::new(tmp.path().join("remote"));
        r.upload_dir(&stage, "backups/2024-01-01_00-00-00").expect("upload");
        assert_eq!(r.list_dirs("backups").expect("list"), vec!["2024-01-01_00-00-00"]);
        assert_eq!(
            r.read_file("backups/2024-01-01_00-00-00/manifest.yaml")
                .expect("read"),
            "mode: full\n"
        );
    }

    #[test]
    fn missing_paths_map_to_not_found_or_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let r = LocalRemote::new(tmp.path());
        assert!(r.list_dirs("nothing/here").expect("list").is_empty());
        assert_eq!(
            r.read_file("nothing/manifest.yaml").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(r.purge("nothing").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn rejects_parent_components() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let r = LocalRemote::new(tmp.path());
        assert_eq!(r.list_dirs("../etc").unwrap_err().kind(), ErrorKind::Usage);
    }

    #[test]
    fn remove_empty_dirs_keeps_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("backups");
        fs::create_dir_all(root.join("a/b")).expect("mkdir");
        fs::create_dir_all(root.join("keep")).expect("mkdir");
        fs::write(root.join("keep/f"), "x").expect("write");
        let r = LocalRemote::new(tmp.path());
        r.remove_empty_dirs("backups").expect("rmdirs");
        assert!(root.is_dir());
        assert!(!root.join("a").exists());
        assert!(root.join("keep/f").is_file());
    }

    #[test]
    fn size_counts_nested_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let snap = tmp.path().join("backups/s1");
        fs::create_dir_all(snap.join("sub")).expect("mkdir");
        fs::write(snap.join("manifest.yaml"), "mode: full\n").expect("write");
        fs::write(snap.join("sub/blob"), vec![0u8; 100]).expect("write");
        let r = LocalRemote::new(tmp.path());
        let got = r.size("backups/s1").expect("size");
        assert_eq!(got.files, 2);
        assert_eq!(got.bytes, 111);
        assert_eq!(r.size("backups/none").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn download_matching_filters_by_suffix() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let snap = tmp.path().join("remote/s1");
        fs::create_dir_all(&snap).expect("mkdir");
        fs::write(snap.join("media.snar"), "t").expect("write");
        fs::write(snap.join("media.tar.gz"), "a").expect("write");
        let r = LocalRemote::new(tmp.path().join("remote"));
        let out = tmp.path().join("out");
        r.download_matching("s1", ".snar", &out).expect("download");
        assert!(out.join("media.snar").is_file());
        assert!(!out.join("media.tar.gz").exists());
    }
}
