//! Remote snapshot storage.
//!
//! Paths handed to a [`RemoteStore`] are slash-separated and relative to the
//! store's root (the rclone remote, or the local base directory).

mod local;
mod rclone;

use std::path::Path;

pub use local::LocalRemote;
pub use rclone::RcloneRemote;

use crate::config::{RemoteKind, Settings};
use crate::error::Result;
use crate::retry::{RetryConfig, with_retry};

pub trait RemoteStore {
    /// Human readable location, used in log lines.
    fn describe(&self, path: &str) -> String;

    /// Immediate subdirectory names of `path`, sorted. A missing `path`
    /// lists as empty.
    fn list_dirs(&self, path: &str) -> Result<Vec<String>>;

    /// Immediate file names of `path`, sorted. A missing `path` lists as
    /// empty.
    fn list_files(&self, path: &str) -> Result<Vec<String>>;

    fn read_file(&self, path: &str) -> Result<String>;

    /// Copy the contents of `local` into `path` in one transfer.
    fn upload_dir(&self, local: &Path, path: &str) -> Result<()>;

    fn download_dir(&self, path: &str, local: &Path) -> Result<()>;

    /// Copy only the files of `path` whose name ends with `suffix`.
    fn download_matching(&self, path: &str, suffix: &str, local: &Path) -> Result<()>;

    /// Delete `path` and everything under it.
    fn purge(&self, path: &str) -> Result<()>;

    /// Remove empty directories below `path`, keeping `path` itself. A
    /// missing `path` is not an error.
    fn remove_empty_dirs(&self, path: &str) -> Result<()>;

    /// File count and total bytes stored under `path`.
    fn size(&self, path: &str) -> Result<RemoteSize>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteSize {
    pub files: u64,
    pub bytes: u64,
}

/// Retries transient failures of the wrapped store.
pub struct RetryingRemote {
    inner: Box<dyn RemoteStore>,
    retry: RetryConfig,
}

impl RetryingRemote {
    pub fn new(inner: Box<dyn RemoteStore>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

impl RemoteStore for RetryingRemote {
    fn describe(&self, path: &str) -> String {
        self.inner.describe(path)
    }

    fn list_dirs(&self, path: &str) -> Result<Vec<String>> {
        with_retry(&self.retry, "list", || self.inner.list_dirs(path))
    }

    fn list_files(&self, path: &str) -> Result<Vec<String>> {
        with_retry(&self.retry, "list", || self.inner.list_files(path))
    }

    fn read_file(&self, path: &str) -> Result<String> {
        with_retry(&self.retry, "read", || self.inner.read_file(path))
    }

    fn upload_dir(&self, local: &Path, path: &str) -> Result<()> {
        with_retry(&self.retry, "upload", || self.inner.upload_dir(local, path))
    }

    fn download_dir(&self, path: &str, local: &Path) -> Result<()> {
        with_retry(&self.retry, "download", || self.inner.download_dir(path, local))
    }

    fn download_matching(&self, path: &str, suffix: &str, local: &Path) -> Result<()> {
        with_retry(&self.retry, "download", || {
            self.inner.download_matching(path, suffix, local)
        })
    }

    fn purge(&self, path: &str) -> Result<()> {
        with_retry(&self.retry, "purge", || self.inner.purge(path))
    }

    fn remove_empty_dirs(&self, path: &str) -> Result<()> {
        with_retry(&self.retry, "rmdirs", || self.inner.remove_empty_dirs(path))
    }

    fn size(&self, path: &str) -> Result<RemoteSize> {
        with_retry(&self.retry, "size", || self.inner.size(path))
    }
}

pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

pub fn open(settings: &Settings) -> Result<Box<dyn RemoteStore>> {
    let inner: Box<dyn RemoteStore> = match settings.remote.kind {
        RemoteKind::Rclone => Box::new(RcloneRemote::new(
            &settings.remote.name,
            settings.remote.transfers,
            settings.remote.checkers,
        )),
        RemoteKind::Local => {
            let root = settings.remote.root.clone().ok_or_else(|| {
                crate::error::Error::usage("local remote has no root directory")
            })?;
            Box::new(LocalRemote::new(root))
        }
    };
    Ok(Box::new(RetryingRemote::new(inner, settings.retry.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::Cell;

    struct Flaky {
        failures: Cell<u32>,
    }

    impl RemoteStore for Flaky {
        fn describe(&self, path: &str) -> String {
            format!("flaky:{path}")
        }
        fn list_dirs(&self, _path: &str) -> Result<Vec<String>> {
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(Error::transient("listing timed out"));
            }
            Ok(vec!["2024-01-01_00-00-00".into()])
        }
        fn list_files(&self, _path: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn read_file(&self, path: &str) -> Result<String> {
            Err(Error::not_found(format!("{path} missing")))
        }
        fn upload_dir(&self, _local: &Path, _path: &str) -> Result<()> {
            Ok(())
        }
        fn download_dir(&self, _path: &str, _local: &Path) -> Result<()> {
            Ok(())
        }
        fn download_matching(&self, _path: &str, _suffix: &str, _local: &Path) -> Result<()> {
            Ok(())
        }
        fn purge(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        fn remove_empty_dirs(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        fn size(&self, _path: &str) -> Result<RemoteSize> {
            Ok(RemoteSize::default())
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            retry_delay_ms: 1,
            retry_max_delay_ms: 1,
        }
    }

    #[test]
    fn retrying_remote_absorbs_transient_failures() {
        let r = RetryingRemote::new(
            Box::new(Flaky {
                failures: Cell::new(2),
            }),
            fast(),
        );
        assert_eq!(r.list_dirs("backups").expect("list").len(), 1);
    }

    #[test]
    fn retrying_remote_passes_not_found_through() {
        let r = RetryingRemote::new(
            Box::new(Flaky {
                failures: Cell::new(0),
            }),
            fast(),
        );
        let err = r.read_file("x/manifest.yaml").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn join_handles_trailing_slash() {
        assert_eq!(join("backups/john/", "2024"), "backups/john/2024");
        assert_eq!(join("", "2024"), "2024");
    }
}
