use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::retention::RetentionPolicy;
use crate::retry::RetryConfig;

const DEFAULT_INSTANCE: &str = "paperless";
const DEFAULT_REMOTE_NAME: &str = "pcloud";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    #[default]
    Rclone,
    Local,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RemoteConfig {
    pub kind: RemoteKind,
    /// rclone remote name (the part before the colon).
    pub name: Option<String>,
    /// Base directory for `kind = "local"`.
    pub root: Option<String>,
    pub path: Option<String>,
    pub archive_path: Option<String>,
    pub transfers: Option<usize>,
    pub checkers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub service: Option<String>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub verify_image: Option<String>,
    pub ready_timeout_secs: Option<u64>,
    pub load_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirKind {
    #[default]
    Data,
    /// Instance-specific configuration (e.g. a sync service's state folder).
    /// Skipped by restores that keep the destination's configuration.
    Config,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackedDirConfig {
    pub name: String,
    /// Absolute, or relative to the data root (`kind = "data"`) or the stack
    /// dir (`kind = "config"`). Defaults to `<base>/<name>`.
    pub path: Option<String>,
    #[serde(default)]
    pub kind: DirKind,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RestoreConfig {
    pub keep_config: bool,
    pub restore_config_dirs: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BackupConfig {
    pub instance_name: Option<String>,
    pub data_root: Option<String>,
    pub stack_dir: Option<String>,
    pub env_file: Option<String>,
    pub compose_file: Option<String>,
    pub compose_project: Option<String>,
    pub staging_dir: Option<String>,
    pub remote: RemoteConfig,
    pub retention: Option<RetentionPolicy>,
    pub database: DatabaseConfig,
    pub dirs: Option<Vec<TrackedDirConfig>>,
    pub retry: RetryConfig,
    pub restore: RestoreConfig,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub kind: RemoteKind,
    pub name: String,
    pub root: Option<PathBuf>,
    pub standard_path: String,
    pub archive_path: String,
    pub transfers: usize,
    pub checkers: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub service: String,
    pub name: String,
    pub user: String,
    pub verify_image: String,
    pub ready_timeout: Duration,
    pub load_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedDir {
    pub name: String,
    pub path: PathBuf,
    pub kind: DirKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Keep the destination's `.env`/compose file (restore into a freshly
    /// provisioned or renamed instance).
    pub keep_config: bool,
    /// Restore `config`-kind directories even when `keep_config` is set.
    pub restore_config_dirs: bool,
}

/// Fully resolved, immutable run configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub instance_name: String,
    pub data_root: PathBuf,
    pub stack_dir: PathBuf,
    pub env_file: PathBuf,
    pub compose_file: PathBuf,
    pub compose_project: Option<String>,
    pub staging_parent: PathBuf,
    pub remote: RemoteSettings,
    pub retention: RetentionPolicy,
    pub database: DatabaseSettings,
    pub dirs: Vec<TrackedDir>,
    pub retry: RetryConfig,
    pub restore: RestoreOptions,
}

pub fn load_file(path: &Path) -> Result<BackupConfig> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))
}

/// Load settings: optional TOML file, then the instance `.env` file, then the
/// process environment (which wins).
pub fn load(config_path: Option<&Path>) -> Result<Settings> {
    let cfg = match config_path {
        Some(p) => load_file(p)?,
        None => BackupConfig::default(),
    };
    let lookup = |k: &str| std::env::var(k).ok();

    // First pass only locates the env file; it may define the instance name
    // and paths used by the second pass.
    let first = resolve(&cfg, &lookup)?;
    if first.env_file.is_file() {
        dotenv::from_path(&first.env_file).map_err(|e| {
            Error::msg(format!(
                "failed to load env file {}: {e}",
                first.env_file.display()
            ))
        })?;
        tracing::debug!("loaded environment from {}", first.env_file.display());
    } else {
        tracing::warn!(
            "no env file at {}; using defaults and process environment",
            first.env_file.display()
        );
    }
    resolve(&cfg, &lookup)
}

fn env_value(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

fn env_days(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<Option<u32>> {
    let Some(raw) = env_value(lookup, key) else {
        return Ok(None);
    };
    raw.parse::<u32>()
        .map(Some)
        .map_err(|_| Error::usage(format!("{key}='{raw}' is not a day count")))
}

fn env_flag(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    env_value(lookup, key).map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "yes" | "true" | "on"
        )
    })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::usage("empty path in configuration"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::usage("tracked directory name is empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        || name.starts_with('.')
    {
        return Err(Error::usage(format!(
            "tracked directory name '{}' contains invalid characters",
            name
        )));
    }
    Ok(name.to_string())
}

fn validate_remote_path(raw: &str, what: &str) -> Result<String> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::usage(format!("{what} is empty")));
    }
    if Path::new(trimmed)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::usage(format!(
            "{what} '{}' must not contain '..'",
            raw
        )));
    }
    Ok(trimmed.to_string())
}

fn default_dirs(data_root: &Path, stack_dir: &Path) -> Vec<TrackedDir> {
    let mut out: Vec<TrackedDir> = ["media", "data", "export"]
        .iter()
        .map(|n| TrackedDir {
            name: (*n).to_string(),
            path: data_root.join(n),
            kind: DirKind::Data,
        })
        .collect();
    out.push(TrackedDir {
        name: "syncthing-config".into(),
        path: stack_dir.join("syncthing-config"),
        kind: DirKind::Config,
    });
    out
}

/// Merge file config with environment lookups into `Settings`.
pub fn resolve(cfg: &BackupConfig, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Settings> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;

    let instance_name = env_value(lookup, "INSTANCE_NAME")
        .or_else(|| non_empty(cfg.instance_name.as_deref()))
        .unwrap_or_else(|| DEFAULT_INSTANCE.to_string());

    let data_root = env_value(lookup, "DATA_ROOT").or_else(|| non_empty(cfg.data_root.as_deref()));
    let data_root = match data_root {
        Some(p) => resolve_user_path(&cwd, &p)?,
        None => PathBuf::from(format!("/home/docker/{instance_name}")),
    };
    let stack_dir = env_value(lookup, "STACK_DIR").or_else(|| non_empty(cfg.stack_dir.as_deref()));
    let stack_dir = match stack_dir {
        Some(p) => resolve_user_path(&cwd, &p)?,
        None => PathBuf::from(format!("/home/docker/{instance_name}-setup")),
    };
    let env_file = env_value(lookup, "ENV_FILE").or_else(|| non_empty(cfg.env_file.as_deref()));
    let env_file = match env_file {
        Some(p) => resolve_user_path(&stack_dir, &p)?,
        None => stack_dir.join(".env"),
    };
    let compose_file =
        match env_value(lookup, "COMPOSE_FILE").or_else(|| non_empty(cfg.compose_file.as_deref())) {
            Some(p) => resolve_user_path(&stack_dir, &p)?,
            None => stack_dir.join("docker-compose.yml"),
        };
    let compose_project = env_value(lookup, "COMPOSE_PROJECT")
        .or_else(|| non_empty(cfg.compose_project.as_deref()));
    let staging_parent = match non_empty(cfg.staging_dir.as_deref()) {
        Some(p) => resolve_user_path(&cwd, &p)?,
        None => std::env::temp_dir(),
    };

    let remote_name = env_value(lookup, "RCLONE_REMOTE_NAME")
        .or_else(|| non_empty(cfg.remote.name.as_deref()))
        .unwrap_or_else(|| DEFAULT_REMOTE_NAME.to_string());
    let standard_path = validate_remote_path(
        &env_value(lookup, "RCLONE_REMOTE_PATH")
            .or_else(|| non_empty(cfg.remote.path.as_deref()))
            .unwrap_or_else(|| format!("backups/paperless/{instance_name}")),
        "remote path",
    )?;
    let archive_path = validate_remote_path(
        &env_value(lookup, "RCLONE_ARCHIVE_PATH")
            .or_else(|| non_empty(cfg.remote.archive_path.as_deref()))
            .unwrap_or_else(|| format!("{standard_path}/archive")),
        "archive path",
    )?;
    if archive_path == standard_path {
        return Err(Error::usage(
            "archive path must differ from the standard remote path",
        ));
    }
    let root = match cfg.remote.kind {
        RemoteKind::Local => {
            let raw = non_empty(cfg.remote.root.as_deref()).ok_or_else(|| {
                Error::usage("remote.root is required when remote.kind = \"local\"")
            })?;
            Some(resolve_user_path(&cwd, &raw)?)
        }
        RemoteKind::Rclone => None,
    };
    let remote = RemoteSettings {
        kind: cfg.remote.kind,
        name: remote_name,
        root,
        standard_path,
        archive_path,
        transfers: cfg
            .remote
            .transfers
            .unwrap_or_else(|| num_cpus::get().clamp(2, 8))
            .max(1),
        checkers: cfg.remote.checkers.unwrap_or(8).max(1),
    };

    let mut retention = cfg.retention.unwrap_or_default();
    if let Some(days) = env_days(lookup, "RETENTION_DAYS")? {
        retention.keep_all_days = days;
    }
    if let Some(days) = env_days(lookup, "RETENTION_MONTHLY_DAYS")? {
        retention.keep_monthly_days = days;
    }

    let db_name = env_value(lookup, "POSTGRES_DB")
        .or_else(|| non_empty(cfg.database.name.as_deref()))
        .unwrap_or_else(|| "paperless".to_string());
    let db_user = env_value(lookup, "POSTGRES_USER")
        .or_else(|| non_empty(cfg.database.user.as_deref()))
        .unwrap_or_else(|| "paperless".to_string());
    let database = DatabaseSettings {
        service: non_empty(cfg.database.service.as_deref()).unwrap_or_else(|| "db".into()),
        name: db_name,
        user: db_user,
        verify_image: non_empty(cfg.database.verify_image.as_deref())
            .unwrap_or_else(|| "postgres".into()),
        ready_timeout: Duration::from_secs(cfg.database.ready_timeout_secs.unwrap_or(60)),
        load_timeout: Duration::from_secs(cfg.database.load_timeout_secs.unwrap_or(1800)),
    };

    let dirs = match &cfg.dirs {
        None => default_dirs(&data_root, &stack_dir),
        Some(list) => {
            let mut seen = BTreeSet::<String>::new();
            let mut out = Vec::with_capacity(list.len());
            for d in list {
                let name = safe_name(&d.name)?;
                if !seen.insert(name.clone()) {
                    return Err(Error::usage(format!(
                        "tracked directory '{}' is listed twice",
                        name
                    )));
                }
                let base = match d.kind {
                    DirKind::Data => &data_root,
                    DirKind::Config => &stack_dir,
                };
                let path = match non_empty(d.path.as_deref()) {
                    Some(p) => resolve_user_path(base, &p)?,
                    None => base.join(&name),
                };
                out.push(TrackedDir {
                    name,
                    path,
                    kind: d.kind,
                });
            }
            out
        }
    };

    let restore = RestoreOptions {
        keep_config: env_flag(lookup, "MERGE_CONFIG").unwrap_or(cfg.restore.keep_config),
        restore_config_dirs: env_flag(lookup, "RESTORE_SYNCTHING")
            .unwrap_or(cfg.restore.restore_config_dirs),
    };

    Ok(Settings {
        instance_name,
        data_root,
        stack_dir,
        env_file,
        compose_file,
        compose_project,
        staging_parent,
        remote,
        retention,
        database,
        dirs,
        retry: cfg.retry.clone(),
        restore,
    })
}
