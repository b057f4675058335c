#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use stackvault::config::{self, BackupConfig, Settings};
use stackvault::database::Database;
use stackvault::manifest::IMAGES_TXT;
use stackvault::remote::LocalRemote;
use stackvault::stack::Stack;
use stackvault::{Error, Result};

pub fn have_bin(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn have_tar() -> bool {
    if have_bin("tar") {
        return true;
    }
    eprintln!("skipping: tar not available");
    false
}

pub fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

/// Records what the engine asked the database to do.
#[derive(Default)]
pub struct FakeDb {
    pub fail_dump: bool,
    pub fail_verify: bool,
    pub dumps: Cell<u32>,
    pub restored: RefCell<Vec<String>>,
    pub verified: Cell<u32>,
}

impl Database for FakeDb {
    fn dump(&self, dest: &Path) -> Result<()> {
        if self.fail_dump {
            return Err(Error::msg("pg_dump: connection refused"));
        }
        let n = self.dumps.get() + 1;
        self.dumps.set(n);
        fs::write(dest, format!("-- dump {n}\n"))?;
        Ok(())
    }

    fn restore(&self, dump: &Path) -> Result<()> {
        self.restored.borrow_mut().push(fs::read_to_string(dump)?);
        Ok(())
    }

    fn verify_dump(&self, _dump: &Path) -> Result<()> {
        self.verified.set(self.verified.get() + 1);
        if self.fail_verify {
            return Err(Error::msg("ERROR: relation does not exist"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStack {
    pub calls: RefCell<Vec<&'static str>>,
}

impl Stack for FakeStack {
    fn stop(&self) -> Result<()> {
        self.calls.borrow_mut().push("stop");
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.calls.borrow_mut().push("start");
        Ok(())
    }

    fn capture_images(&self, dir: &Path) -> Result<()> {
        fs::write(dir.join(IMAGES_TXT), "postgres:16\nghcr.io/paperless-ngx/paperless-ngx:2\n")?;
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        self.calls.borrow_mut().push("health");
        Ok(())
    }
}

/// A throwaway instance: data root, stack dir and a local remote.
pub struct Instance {
    pub tmp: TempDir,
    pub settings: Settings,
    pub remote: LocalRemote,
}

impl Instance {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let data = tmp.path().join("data-root");
        let stack = tmp.path().join("stack");
        fs::create_dir_all(&data).expect("mkdir data");
        fs::create_dir_all(&stack).expect("mkdir stack");
        fs::write(stack.join(".env"), "INSTANCE_NAME=test\nSECRET=original\n").expect("env");
        fs::write(stack.join("docker-compose.yml"), "services: {}\n").expect("compose");

        let text = format!(
            r#"
instance_name = "test"
data_root = {data:?}
stack_dir = {stack:?}
staging_dir = {staging:?}

[remote]
kind = "local"
root = {remote:?}
path = "backups/test"

[retry]
max_retries = 0

[[dirs]]
name = "media"

[[dirs]]
name = "data"

[[dirs]]
name = "sync"
kind = "config"
"#,
            data = data.display().to_string(),
            stack = stack.display().to_string(),
            staging = tmp.path().join("staging").display().to_string(),
            remote = tmp.path().join("remote").display().to_string(),
        );
        let cfg: BackupConfig = toml::from_str(&text).expect("config");
        let settings = config::resolve(&cfg, &|_: &str| None).expect("settings");
        let remote = LocalRemote::new(tmp.path().join("remote"));
        Self {
            tmp,
            settings,
            remote,
        }
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.settings
            .dirs
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.path.clone())
            .expect("tracked dir")
    }

    pub fn remote_dir(&self, rel: &str) -> PathBuf {
        self.tmp.path().join("remote").join(rel)
    }

    pub fn standard(&self, name: &str) -> PathBuf {
        self.remote_dir(&format!("backups/test/{name}"))
    }

    pub fn archived(&self, name: &str) -> PathBuf {
        self.remote_dir(&format!("backups/test/archive/{name}"))
    }

    /// Plant a snapshot directory with the given manifest text directly on
    /// the remote.
    pub fn plant(&self, rel: &str, manifest: Option<&str>) {
        let dir = self.remote_dir(rel);
        fs::create_dir_all(&dir).expect("mkdir snapshot");
        if let Some(m) = manifest {
            fs::write(dir.join("manifest.yaml"), m).expect("manifest");
        }
    }
}
