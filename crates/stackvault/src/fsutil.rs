use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", path.display())))
}

/// Write through a sibling temp file and rename over `path`.
pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

pub fn clear_dir_or_file(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_dir() {
                fs::remove_dir_all(path).map_err(|e| {
                    Error::msg(format!(
                        "failed to remove directory {}: {e}",
                        path.display()
                    ))
                })
            } else {
                fs::remove_file(path)
                    .map_err(|e| Error::msg(format!("failed to remove {}: {e}", path.display())))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!(
            "failed to inspect {} before cleanup: {e}",
            path.display()
        ))),
    }
}

/// Remove everything inside `dir` but keep the directory itself (it may be a
/// bind mount the stack expects to exist).
pub fn clear_dir_contents(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return ensure_dir(dir);
    }
    let read_failed =
        |e: std::io::Error| Error::msg(format!("failed to read {}: {e}", dir.display()));
    for entry in fs::read_dir(dir).map_err(read_failed)? {
        let entry = entry.map_err(read_failed)?;
        clear_dir_or_file(&entry.path())?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    clear_dir_or_file(dst)?;
    let target = fs::read_link(src)
        .map_err(|e| Error::msg(format!("failed to read symlink {}: {e}", src.display())))?;
    symlink(&target, dst).map_err(|e| {
        Error::msg(format!(
            "failed to create symlink {} -> {}: {e}",
            dst.display(),
            target.display()
        ))
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    copy_file(src, dst)
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}

/// Recursive copy of a file or tree; symlinks are recreated, not followed.
pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)
        .map_err(|e| Error::msg(format!("failed to stat {}: {e}", src.display())))?;
    if meta.file_type().is_symlink() {
        return copy_symlink(src, dst);
    }
    if !meta.is_dir() {
        return copy_file(src, dst);
    }
    ensure_dir(dst)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&out)?;
        } else if entry.file_type().is_symlink() {
            copy_symlink(p, &out)?;
        } else {
            copy_file(p, &out)?;
        }
    }
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Regular files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let read_failed =
        |e: std::io::Error| Error::msg(format!("failed to read {}: {e}", dir.display()));
    for entry in fs::read_dir(dir).map_err(read_failed)? {
        let entry = entry.map_err(read_failed)?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("nested").join("status.ok");
        atomic_write_text(&p, "one").expect("write");
        atomic_write_text(&p, "two").expect("write");
        assert_eq!(fs::read_to_string(&p).expect("read"), "two");
        let leftovers: Vec<_> = fs::read_dir(p.parent().expect("parent"))
            .expect("read_dir")
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn clear_dir_contents_keeps_the_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let d = tmp.path().join("media");
        fs::create_dir_all(d.join("a/b")).expect("mkdir");
        fs::write(d.join("a/b/file"), "x").expect("write");
        fs::write(d.join("top"), "y").expect("write");
        clear_dir_contents(&d).expect("clear");
        assert!(d.is_dir());
        assert_eq!(fs::read_dir(&d).expect("read_dir").count(), 0);
    }

    #[test]
    fn copy_path_copies_trees() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).expect("mkdir");
        fs::write(src.join("sub/f.txt"), "hello").expect("write");
        let dst = tmp.path().join("dst");
        copy_path(&src, &dst).expect("copy");
        assert_eq!(fs::read_to_string(dst.join("sub/f.txt")).expect("read"), "hello");
    }

    #[test]
    fn sha256_of_known_input() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("abc");
        fs::write(&p, "abc").expect("write");
        assert_eq!(
            sha256_file(&p).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
