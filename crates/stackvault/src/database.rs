//! Logical dump, replay and disposable-instance verification of the
//! application's PostgreSQL database.

use std::fs;
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;

use crate::config::DatabaseSettings;
use crate::error::{Error, Result};
use crate::exec::{
    command_summary, run_command_capture, run_command_output, run_to_file, run_with_input,
};
use crate::stack::Compose;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub trait Database {
    /// Write a logical dump of the live database to `dest`.
    fn dump(&self, dest: &Path) -> Result<()>;

    /// Destructively replace the live database with `dump` (plain or `.gz`).
    fn restore(&self, dump: &Path) -> Result<()>;

    /// Load `dump` into a throwaway instance. Never touches the live database.
    fn verify_dump(&self, dump: &Path) -> Result<()>;
}

pub struct ComposePostgres {
    compose: Compose,
    db: DatabaseSettings,
}

impl ComposePostgres {
    pub fn new(compose: Compose, db: DatabaseSettings) -> Self {
        Self { compose, db }
    }

    fn exec(&self, args: &[&str]) -> Command {
        let mut full = vec!["exec", "-T", self.db.service.as_str()];
        full.extend_from_slice(args);
        self.compose.command(full)
    }

    fn psql(&self, database: &str, sql: &str) -> Command {
        self.exec(&[
            "psql",
            "-U",
            &self.db.user,
            "-d",
            database,
            "-v",
            "ON_ERROR_STOP=1",
            "-tAc",
            sql,
        ])
    }

    fn wait_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.db.ready_timeout;
        loop {
            let mut cmd = self.exec(&["pg_isready", "-U", &self.db.user]);
            if let Ok(out) = run_command_output(&mut cmd) {
                if out.status.success() {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::msg(format!(
                    "database service '{}' not ready after {}s",
                    self.db.service,
                    self.db.ready_timeout.as_secs()
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn database_exists(&self) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM pg_database WHERE datname = {}",
            quote_literal(&self.db.name)
        );
        let mut cmd = self.psql("postgres", &sql);
        let out = run_command_output(&mut cmd)?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "failed to query databases: {}",
                command_summary(&out)
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim() == "1")
    }
}

impl Database for ComposePostgres {
    fn dump(&self, dest: &Path) -> Result<()> {
        let cmd = self.exec(&["pg_dump", "-U", &self.db.user, &self.db.name]);
        tracing::info!("dumping database '{}'", self.db.name);
        run_to_file(cmd, dest)
    }

    fn restore(&self, dump: &Path) -> Result<()> {
        run_command_capture(self.compose.command(["up", "-d", self.db.service.as_str()]))?;
        self.wait_ready()?;

        if !self.database_exists()? {
            tracing::info!("creating database '{}'", self.db.name);
            let sql = format!(
                "CREATE DATABASE {} OWNER {}",
                quote_ident(&self.db.name),
                quote_ident(&self.db.user)
            );
            run_command_capture(self.psql("postgres", &sql))?;
        }

        tracing::info!("resetting schema public in '{}'", self.db.name);
        run_command_capture(self.psql(
            &self.db.name,
            "DROP SCHEMA IF EXISTS public CASCADE; CREATE SCHEMA public;",
        ))?;

        tracing::info!("replaying {}", dump.display());
        let load = self.exec(&["psql", "-U", &self.db.user, "-d", &self.db.name]);
        run_with_input(load, open_dump(dump)?, Some(self.db.load_timeout))
            .map_err(|e| e.context("database restore"))
    }

    fn verify_dump(&self, dump: &Path) -> Result<()> {
        let container = ScratchContainer::start(&self.db.verify_image)?;
        container.wait_ready(self.db.ready_timeout)?;

        let role = format!("CREATE ROLE {} LOGIN", quote_ident(&self.db.user));
        let mut cmd = container.exec(&["psql", "-U", "postgres", "-tAc", &role]);
        let out = run_command_output(&mut cmd)?;
        if !out.status.success() {
            tracing::debug!("role setup in scratch database: {}", command_summary(&out));
        }

        let mut load = Command::new("docker");
        load.args(["exec", "-i", container.name.as_str()])
            .args(["psql", "-U", "postgres", "-v", "ON_ERROR_STOP=1", "-q", "-d", "postgres"]);
        run_with_input(load, open_dump(dump)?, Some(self.db.load_timeout))
            .map_err(|e| e.context("loading dump into scratch database"))
    }
}

/// A `docker run --rm` database with no network, removed on drop.
struct ScratchContainer {
    name: String,
}

impl ScratchContainer {
    fn start(image: &str) -> Result<Self> {
        let name = format!(
            "stackvault-verify-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        );
        let password = format!("{:016x}", rand::random::<u64>());
        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--rm", "--network", "none", "--name", name.as_str()])
            .arg("-e")
            .arg(format!("POSTGRES_PASSWORD={password}"))
            .arg(image);
        run_command_capture(cmd).map_err(|e| e.context("starting scratch database"))?;
        Ok(Self { name })
    }

    fn exec(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("docker");
        cmd.args(["exec", self.name.as_str()]).args(args);
        cmd
    }

    /// The image's init phase runs a socket-only server, so readiness is
    /// checked over TCP to wait for the final server.
    fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut cmd = self.exec(&["pg_isready", "-h", "127.0.0.1", "-U", "postgres"]);
            if let Ok(out) = run_command_output(&mut cmd) {
                if out.status.success() {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::msg(format!(
                    "scratch database not ready after {}s",
                    timeout.as_secs()
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for ScratchContainer {
    fn drop(&mut self) {
        let mut cmd = Command::new("docker");
        cmd.args(["rm", "-f", self.name.as_str()]);
        if let Err(e) = run_command_capture(cmd) {
            tracing::warn!("failed to remove scratch container {}: {e}", self.name);
        }
    }
}

/// Dump reader; `.gz` files are decompressed on the fly.
pub fn open_dump(path: &Path) -> Result<Box<dyn Read + Send>> {
    let f = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let gz = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if gz {
        Ok(Box::new(GzDecoder::new(BufReader::new(f))))
    } else {
        Ok(Box::new(BufReader::new(f)))
    }
}

fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
