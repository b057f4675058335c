//! Two-tier, age-based deletion of remote snapshots.
//!
//! Ages are whole days between the date in the snapshot name and today
//! (UTC). Names without a leading date are never deleted.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Deserialize;

use crate::error::Result;
use crate::manifest::parse_snapshot_date;
use crate::remote::{RemoteStore, join};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Every snapshot up to this age survives. 0 disables the standard pass.
    pub keep_all_days: u32,
    /// Archive snapshots dated the 1st survive up to this age. 0 disables the
    /// archive pass.
    pub keep_monthly_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_all_days: 30,
            keep_monthly_days: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Keep(&'static str),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub name: String,
    pub age_days: Option<i64>,
    pub decision: Decision,
}

fn age_days(name: &str, today: NaiveDate) -> Option<i64> {
    parse_snapshot_date(name).map(|d| (today - d).num_days())
}

pub fn plan_standard(
    names: &[String],
    policy: &RetentionPolicy,
    today: NaiveDate,
) -> Vec<PlanEntry> {
    names
        .iter()
        .map(|name| {
            let age = age_days(name, today);
            let decision = match age {
                None => Decision::Keep("undated"),
                Some(_) if policy.keep_all_days == 0 => Decision::Keep("disabled"),
                Some(a) if a <= i64::from(policy.keep_all_days) => Decision::Keep("recent"),
                Some(_) => Decision::Delete,
            };
            PlanEntry {
                name: name.clone(),
                age_days: age,
                decision,
            }
        })
        .collect()
}

pub fn plan_archive(
    names: &[String],
    policy: &RetentionPolicy,
    today: NaiveDate,
) -> Vec<PlanEntry> {
    names
        .iter()
        .map(|name| {
            let age = age_days(name, today);
            let first_of_month = parse_snapshot_date(name)
                .map(|d| d.day() == 1)
                .unwrap_or(false);
            let decision = match age {
                None => Decision::Keep("undated"),
                Some(_) if policy.keep_monthly_days == 0 => Decision::Keep("disabled"),
                Some(a) if a <= i64::from(policy.keep_all_days) => Decision::Keep("recent"),
                Some(a) if a <= i64::from(policy.keep_monthly_days) && first_of_month => {
                    Decision::Keep("monthly")
                }
                Some(_) => Decision::Delete,
            };
            PlanEntry {
                name: name.clone(),
                age_days: age,
                decision,
            }
        })
        .collect()
}

#[derive(Debug, Default, Clone)]
pub struct RetentionReport {
    pub deleted: Vec<String>,
    pub kept: Vec<String>,
    pub failures: Vec<String>,
}

impl RetentionReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

fn execute(
    remote: &dyn RemoteStore,
    root: &str,
    plan: Vec<PlanEntry>,
    report: &mut RetentionReport,
) {
    for entry in plan {
        let path = join(root, &entry.name);
        match entry.decision {
            Decision::Keep(_) => report.kept.push(path),
            Decision::Delete => {
                tracing::info!(
                    "deleting {} (age {} days)",
                    remote.describe(&path),
                    entry.age_days.unwrap_or_default()
                );
                match remote.purge(&path) {
                    Ok(()) => report.deleted.push(path),
                    Err(e) => {
                        tracing::warn!("failed to delete {}: {e}", remote.describe(&path));
                        report.failures.push(format!("{path}: {e}"));
                    }
                }
            }
        }
    }
    if let Err(e) = remote.remove_empty_dirs(root) {
        tracing::warn!("failed to remove empty directories under {root}: {e}");
        report.failures.push(format!("{root}: {e}"));
    }
}

/// Apply both passes. Listing failures abort; individual deletion failures
/// are recorded in the report.
pub fn apply_retention(
    remote: &dyn RemoteStore,
    standard_root: &str,
    archive_root: &str,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<RetentionReport> {
    let today = now.date_naive();
    let mut report = RetentionReport::default();

    // The archive tier may live under the standard root; its directory name
    // carries no date so the standard pass keeps it.
    let standard = remote.list_dirs(standard_root)?;
    tracing::info!(
        "retention: {} standard entries, keep {} days",
        standard.len(),
        policy.keep_all_days
    );
    execute(
        remote,
        standard_root,
        plan_standard(&standard, policy, today),
        &mut report,
    );

    let archive = remote.list_dirs(archive_root)?;
    tracing::info!(
        "retention: {} archive entries, keep monthly up to {} days",
        archive.len(),
        policy.keep_monthly_days
    );
    execute(
        remote,
        archive_root,
        plan_archive(&archive, policy, today),
        &mut report,
    );
    Ok(report)
}
