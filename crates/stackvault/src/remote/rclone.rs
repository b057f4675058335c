use std::path::Path;
use std::process::{Command, Output};

use serde::Deserialize;

use crate::error::{Error, ErrorKind, Result};
use crate::exec::{command_summary, run_command_output};

use super::{RemoteSize, RemoteStore};

/// `rclone` against a configured remote (`<name>:<path>`).
pub struct RcloneRemote {
    bin: String,
    name: String,
    transfers: usize,
    checkers: usize,
}

impl RcloneRemote {
    pub fn new(name: &str, transfers: usize, checkers: usize) -> Self {
        Self {
            bin: "rclone".into(),
            name: name.trim().trim_end_matches(':').to_string(),
            transfers,
            checkers,
        }
    }

    pub fn with_binary(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    fn target(&self, path: &str) -> String {
        format!("{}:{}", self.name, path.trim_matches('/'))
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        cmd
    }

    fn upload_command(&self, local: &Path, path: &str) -> Command {
        let transfers = self.transfers.to_string();
        let checkers = self.checkers.to_string();
        let mut cmd = self.command(&[
            "copy",
            "--checksum",
            "--transfers",
            &transfers,
            "--checkers",
            &checkers,
            "--fast-list",
        ]);
        cmd.arg(local).arg(self.target(path));
        cmd
    }

    fn run(&self, mut cmd: Command, what: &str, path: &str) -> Result<Output> {
        let out = run_command_output(&mut cmd)?;
        if out.status.success() {
            return Ok(out);
        }
        Err(classify(out.status.code(), &command_summary(&out))
            .context(format!("rclone {what} {}", self.target(path))))
    }

    fn lsf(&self, path: &str, flag: &str) -> Result<Vec<String>> {
        let cmd = {
            let mut c = self.command(&["lsf", flag]);
            c.arg(self.target(path));
            c
        };
        match self.run(cmd, "lsf", path) {
            Ok(out) => Ok(parse_lsf(&String::from_utf8_lossy(&out.stdout))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

/// rclone exit codes: 3 directory not found, 4 file not found, 1 syntax or
/// usage error, 7 fatal error. Everything else may succeed on retry.
fn classify(code: Option<i32>, summary: &str) -> Error {
    match code {
        Some(3) | Some(4) => Error::not_found(summary.to_string()),
        Some(1) | Some(7) => Error::msg(summary.to_string()),
        _ => Error::transient(summary.to_string()),
    }
}

fn parse_lsf(stdout: &str) -> Vec<String> {
    let mut out: Vec<String> = stdout
        .lines()
        .map(|l| l.trim().trim_end_matches('/').to_string())
        .filter(|l| !l.is_empty())
        .collect();
    out.sort();
    out
}

impl RemoteStore for RcloneRemote {
    fn describe(&self, path: &str) -> String {
        self.target(path)
    }

    fn list_dirs(&self, path: &str) -> Result<Vec<String>> {
        self.lsf(path, "--dirs-only")
    }

    fn list_files(&self, path: &str) -> Result<Vec<String>> {
        self.lsf(path, "--files-only")
    }

    fn read_file(&self, path: &str) -> Result<String> {
        let mut cmd = self.command(&["cat"]);
        cmd.arg(self.target(path));
        let out = self.run(cmd, "cat", path)?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn upload_dir(&self, local: &Path, path: &str) -> Result<()> {
        self.run(self.upload_command(local, path), "copy", path)
            .map(|_| ())
    }

    fn download_dir(&self, path: &str, local: &Path) -> Result<()> {
        let mut cmd = self.command(&["copy", "--checksum"]);
        cmd.arg(self.target(path)).arg(local);
        self.run(cmd, "copy", path).map(|_| ())
    }

    fn download_matching(&self, path: &str, suffix: &str, local: &Path) -> Result<()> {
        let include = format!("*{suffix}");
        let mut cmd = self.command(&["copy", "--include", &include]);
        cmd.arg(self.target(path)).arg(local);
        self.run(cmd, "copy", path).map(|_| ())
    }

    fn purge(&self, path: &str) -> Result<()> {
        let mut cmd = self.command(&["purge"]);
        cmd.arg(self.target(path));
        self.run(cmd, "purge", path).map(|_| ())
    }

    fn remove_empty_dirs(&self, path: &str) -> Result<()> {
        let mut cmd = self.command(&["rmdirs", "--leave-root"]);
        cmd.arg(self.target(path));
        match self.run(cmd, "rmdirs", path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn size(&self, path: &str) -> Result<RemoteSize> {
        let mut cmd = self.command(&["size", "--json"]);
        cmd.arg(self.target(path));
        let out = self.run(cmd, "size", path)?;
        parse_size(&String::from_utf8_lossy(&out.stdout))
    }
}

#[derive(Deserialize)]
struct SizeJson {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    bytes: u64,
}

fn parse_size(stdout: &str) -> Result<RemoteSize> {
    let v: SizeJson = serde_json::from_str(stdout.trim())
        .map_err(|e| Error::msg(format!("failed to parse rclone size output: {e}")))?;
    Ok(RemoteSize {
        files: v.count,
        bytes: v.bytes,
    })
}
