use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use stackvault::catalog::{self, Catalog, StatusMarker, format_bytes};
use stackvault::config::{self, RestoreOptions, Settings};
use stackvault::database::ComposePostgres;
use stackvault::manifest::Mode;
use stackvault::remote::{self, RemoteStore};
use stackvault::restore::Restorer;
use stackvault::retention::apply_retention;
use stackvault::stack::{Compose, ComposeStack};
use stackvault::writer::Writer;
use stackvault::{Error, Result, staging};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Optional TOML config; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackupKind {
    Full,
    #[value(alias = "incr")]
    Incremental,
    Archive,
    /// Apply retention only
    Cleanup,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Take a snapshot, or prune old ones with `cleanup`
    Backup {
        #[arg(value_enum)]
        kind: BackupKind,
    },
    /// Restore a snapshot (default: the newest one)
    Restore {
        name: Option<String>,
        /// Keep this instance's .env and compose file
        #[arg(long)]
        keep_config: bool,
        /// Restore instance-config directories even with --keep-config
        #[arg(long)]
        restore_config_dirs: bool,
    },
    /// List snapshots of both tiers
    Snapshots {
        /// Also show verification status and recorded image versions
        #[arg(long)]
        detail: bool,
    },
    /// Print the chain needed to restore a snapshot
    Chain { name: String },
    /// Delete one snapshot
    Delete {
        name: String,
        /// Delete even if incremental snapshots depend on it
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(args: Args) -> Result<()> {
    let settings = config::load(args.config.as_deref())?;
    let remote = remote::open(&settings)?;
    match args.cmd {
        Command::Backup { kind } => cmd_backup(&settings, remote.as_ref(), kind),
        Command::Restore {
            name,
            keep_config,
            restore_config_dirs,
        } => {
            let options = RestoreOptions {
                keep_config: keep_config || settings.restore.keep_config,
                restore_config_dirs: restore_config_dirs || settings.restore.restore_config_dirs,
            };
            cmd_restore(&settings, remote.as_ref(), name.as_deref(), options)
        }
        Command::Snapshots { detail } => cmd_snapshots(&settings, remote.as_ref(), detail),
        Command::Chain { name } => cmd_chain(&settings, remote.as_ref(), &name),
        Command::Delete { name, force } => cmd_delete(&settings, remote.as_ref(), &name, force),
    }
}

fn sweep(settings: &Settings) {
    if let Err(e) = staging::sweep_stale(&settings.staging_parent, staging::STALE_AFTER) {
        tracing::warn!("stale scratch sweep failed: {e}");
    }
}

fn load_catalog(settings: &Settings, remote: &dyn RemoteStore) -> Result<Catalog> {
    Catalog::load(
        remote,
        &settings.remote.standard_path,
        &settings.remote.archive_path,
    )
}

fn cmd_backup(settings: &Settings, remote: &dyn RemoteStore, kind: BackupKind) -> Result<()> {
    let mode = match kind {
        BackupKind::Cleanup => {
            let report = apply_retention(
                remote,
                &settings.remote.standard_path,
                &settings.remote.archive_path,
                &settings.retention,
                chrono::Utc::now(),
            )?;
            println!(
                "retention: {} deleted, {} kept, {} failed",
                report.deleted.len(),
                report.kept.len(),
                report.failures.len()
            );
            if !report.is_clean() {
                return Err(Error::msg(format!(
                    "retention incomplete: {}",
                    report.failures.join("; ")
                )));
            }
            return Ok(());
        }
        BackupKind::Full => Mode::Full,
        BackupKind::Incremental => Mode::Incremental,
        BackupKind::Archive => Mode::Archive,
    };

    sweep(settings);
    let compose = Compose::from_settings(settings);
    let db = ComposePostgres::new(compose.clone(), settings.database.clone());
    let stack = ComposeStack::new(compose);
    let report = Writer::new(settings, remote, &db, &stack).write_snapshot(mode)?;

    println!(
        "{} snapshot {} uploaded to {}",
        report.mode,
        report.name,
        remote.describe(&report.remote_path)
    );
    if let Some(p) = &report.parent {
        println!("  parent: {p}");
    }
    println!(
        "  verification: {}",
        if report.verified() { "passed" } else { "FAILED" }
    );
    for f in &report.verify.failures {
        println!("    {f}");
    }
    for w in &report.warnings {
        println!("  warning: {w}");
    }
    if let Some(r) = &report.retention {
        println!(
            "  retention: {} deleted, {} kept",
            r.deleted.len(),
            r.kept.len()
        );
    }
    Ok(())
}

fn cmd_restore(
    settings: &Settings,
    remote: &dyn RemoteStore,
    name: Option<&str>,
    options: RestoreOptions,
) -> Result<()> {
    sweep(settings);
    let compose = Compose::from_settings(settings);
    let db = ComposePostgres::new(compose.clone(), settings.database.clone());
    let stack = ComposeStack::new(compose);
    let report = Restorer::new(settings, remote, &db, &stack).restore(name, options)?;

    println!("restored {} ({})", report.target, report.chain.join(" -> "));
    match &report.dump_replayed {
        Some(from) => println!("  database: replayed dump from {from}"),
        None => println!("  database: untouched"),
    }
    println!(
        "  services: {}",
        match (report.started, report.healthy) {
            (true, true) => "running, healthy",
            (true, false) => "running, health check failed",
            _ => "not started",
        }
    );
    for w in &report.warnings {
        println!("  warning: {w}");
    }
    Ok(())
}

fn cmd_snapshots(settings: &Settings, remote: &dyn RemoteStore, detail: bool) -> Result<()> {
    let cat = load_catalog(settings, remote)?;
    if cat.is_empty() {
        println!("no snapshots under {}", remote.describe(&cat.standard_root));
        return Ok(());
    }
    let mut total_bytes = 0u64;
    for entry in cat.entries() {
        let parent = entry.parent().unwrap_or("-");
        if !detail {
            println!(
                "{:<20}  {:<8}  {:<11}  {}",
                entry.name,
                entry.tier,
                entry.mode_label(),
                parent
            );
            continue;
        }
        let (status, images, size) = match catalog::describe(remote, &cat, entry) {
            Ok(d) => {
                total_bytes += d.size.bytes;
                (
                    match d.status {
                        StatusMarker::Ok => "ok",
                        StatusMarker::Failed => "FAIL",
                        StatusMarker::Missing => "?",
                    },
                    if d.has_images { "yes" } else { "no" },
                    format_bytes(d.size.bytes),
                )
            }
            Err(e) => {
                tracing::warn!("{}: {e}", entry.name);
                ("?", "?", "?".to_string())
            }
        };
        println!(
            "{:<20}  {:<8}  {:<11}  {:<20}  status={:<4}  images={:<3}  size={}",
            entry.name,
            entry.tier,
            entry.mode_label(),
            parent,
            status,
            images,
            size
        );
    }
    print!(
        "{} snapshots ({} standard, {} archive)",
        cat.standard.len() + cat.archive.len(),
        cat.standard.len(),
        cat.archive.len()
    );
    if detail {
        print!(", {} stored", format_bytes(total_bytes));
    }
    println!();
    Ok(())
}

fn cmd_chain(settings: &Settings, remote: &dyn RemoteStore, name: &str) -> Result<()> {
    let cat = load_catalog(settings, remote)?;
    for (i, entry) in cat.resolve_chain(name)?.iter().enumerate() {
        println!("{:>2}. {}  {}", i + 1, entry.name, entry.mode_label());
    }
    Ok(())
}

fn cmd_delete(
    settings: &Settings,
    remote: &dyn RemoteStore,
    name: &str,
    force: bool,
) -> Result<()> {
    let cat = load_catalog(settings, remote)?;
    let entry = cat
        .get(name)
        .ok_or_else(|| Error::not_found(format!("snapshot '{name}' not found")))?;
    let dependents: Vec<&str> = cat
        .entries()
        .into_iter()
        .filter(|e| e.parent() == Some(name))
        .map(|e| e.name.as_str())
        .collect();
    if !dependents.is_empty() && !force {
        return Err(Error::usage(format!(
            "'{name}' is the parent of {}; use --force to delete anyway",
            dependents.join(", ")
        )));
    }
    let path = cat.path_of(entry);
    remote.purge(&path)?;
    println!("deleted {}", remote.describe(&path));
    Ok(())
}
