//! The application stack as seen by backup and restore: stop it, start it,
//! record which images it runs, and check it came back healthy.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::exec::{command_summary, run_command_capture, run_command_output, run_to_file};
use crate::manifest::{IMAGES_JSON, IMAGES_TXT};

pub trait Stack {
    fn stop(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    /// Write the deployed image identifiers into `dir`.
    fn capture_images(&self, dir: &Path) -> Result<()>;
    fn health_check(&self) -> Result<()>;
}

/// `docker compose` invocation for one stack.
#[derive(Debug, Clone)]
pub struct Compose {
    pub file: PathBuf,
    pub project: Option<String>,
}

impl Compose {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            file: settings.compose_file.clone(),
            project: settings.compose_project.clone(),
        }
    }

    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("docker");
        cmd.arg("compose");
        if let Some(p) = &self.project {
            cmd.arg("--project-name").arg(p);
        }
        cmd.arg("-f").arg(&self.file);
        cmd.args(args);
        cmd
    }
}

pub struct ComposeStack {
    compose: Compose,
}

impl ComposeStack {
    pub fn new(compose: Compose) -> Self {
        Self { compose }
    }

    fn require_file(&self) -> Result<()> {
        if self.compose.file.is_file() {
            return Ok(());
        }
        Err(Error::msg(format!(
            "compose file not found: {}",
            self.compose.file.display()
        )))
    }
}

impl Stack for ComposeStack {
    fn stop(&self) -> Result<()> {
        if self.require_file().is_err() {
            tracing::warn!(
                "no compose file at {}; nothing to stop",
                self.compose.file.display()
            );
            return Ok(());
        }
        tracing::info!("stopping stack");
        run_command_capture(self.compose.command(["down"]))
    }

    fn start(&self) -> Result<()> {
        self.require_file()?;
        tracing::info!("starting stack");
        run_command_capture(self.compose.command(["up", "-d"]))
    }

    fn capture_images(&self, dir: &Path) -> Result<()> {
        self.require_file()?;
        run_to_file(
            self.compose.command(["images", "--format", "json"]),
            &dir.join(IMAGES_JSON),
        )?;
        run_to_file(
            self.compose.command(["config", "--images"]),
            &dir.join(IMAGES_TXT),
        )
    }

    fn health_check(&self) -> Result<()> {
        let mut cmd = self.compose.command(["ps", "--all", "--format", "json"]);
        let out = run_command_output(&mut cmd)?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "compose ps failed: {}",
                command_summary(&out)
            )));
        }
        let services = parse_ps(&String::from_utf8_lossy(&out.stdout))?;
        check_services(&services)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServiceState {
    #[serde(rename = "Service", default)]
    pub service: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Health", default)]
    pub health: String,
}

/// `compose ps --format json` prints an array on older releases and one
/// object per line on newer ones.
pub fn parse_ps(stdout: &str) -> Result<Vec<ServiceState>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| Error::msg(format!("failed to parse compose ps output: {e}")));
    }
    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str::<ServiceState>(l)
                .map_err(|e| Error::msg(format!("failed to parse compose ps output: {e}")))
        })
        .collect()
}

pub fn check_services(services: &[ServiceState]) -> Result<()> {
    if services.is_empty() {
        return Err(Error::msg("no containers running"));
    }
    let bad: Vec<String> = services
        .iter()
        .filter(|s| s.state != "running" || s.health == "unhealthy")
        .map(|s| {
            if s.health.is_empty() {
                format!("{} ({})", s.service, s.state)
            } else {
                format!("{} ({}, {})", s.service, s.state, s.health)
            }
        })
        .collect();
    if bad.is_empty() {
        return Ok(());
    }
    Err(Error::msg(format!("unhealthy services: {}", bad.join(", "))))
}
