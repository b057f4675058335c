//! Snapshot naming, on-remote layout and the `manifest.yaml` format.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;

use crate::error::{Error, Result};

pub const MANIFEST_FILE: &str = "manifest.yaml";
pub const DUMP_FILE: &str = "postgres.sql";
pub const DUMP_FILE_GZ: &str = "postgres.sql.gz";
pub const SUMS_FILE: &str = "SHA256SUMS";
pub const STATUS_OK: &str = "status.ok";
pub const STATUS_FAIL: &str = "status.fail";
pub const ENV_COPY: &str = ".env";
pub const COMPOSE_COPY: &str = "compose.snapshot.yml";
pub const IMAGES_JSON: &str = "docker-images.json";
pub const IMAGES_TXT: &str = "docker-images.txt";
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
pub const TOKEN_SUFFIX: &str = ".snar";

const NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}$").expect("snapshot name pattern")
    })
}

pub fn snapshot_name(now: DateTime<Utc>) -> String {
    now.format(NAME_FORMAT).to_string()
}

pub fn is_snapshot_name(name: &str) -> bool {
    name_re().is_match(name) && parse_snapshot_time(name).is_some()
}

pub fn parse_snapshot_time(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, NAME_FORMAT).ok()
}

/// Calendar date encoded in a snapshot name. Only the leading `YYYY-MM-DD`
/// is required so hand-named directories still age correctly.
pub fn parse_snapshot_date(name: &str) -> Option<NaiveDate> {
    let head = name.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Full,
    Incremental,
    Archive,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Full => "full",
            Mode::Incremental => "incremental",
            Mode::Archive => "archive",
        }
    }

    /// Full and archive runs reset change-state tokens.
    pub fn is_self_contained(self) -> bool {
        !matches!(self, Mode::Incremental)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Mode::Full),
            "incremental" | "incr" => Ok(Mode::Incremental),
            "archive" => Ok(Mode::Archive),
            other => Err(Error::usage(format!(
                "unknown backup mode '{other}'; expected full/incremental/archive"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lineage {
    Full,
    Archive,
    Incremental { parent: String },
}

impl Lineage {
    pub fn mode(&self) -> Mode {
        match self {
            Lineage::Full => Mode::Full,
            Lineage::Archive => Mode::Archive,
            Lineage::Incremental { .. } => Mode::Incremental,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        match self {
            Lineage::Incremental { parent } => Some(parent.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub lineage: Lineage,
    pub created: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn new(lineage: Lineage, created: DateTime<Utc>) -> Self {
        Self {
            lineage,
            created: Some(created),
        }
    }

    pub fn mode(&self) -> Mode {
        self.lineage.mode()
    }

    pub fn parent(&self) -> Option<&str> {
        self.lineage.parent()
    }

    pub fn render(&self) -> String {
        let mut out = format!("mode: {}\n", self.mode());
        if let Some(created) = self.created {
            out.push_str(&format!(
                "created: {}\n",
                created.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }
        if let Some(parent) = self.parent() {
            out.push_str(&format!("parent: {parent}\n"));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut mode = None::<String>;
        let mut parent = None::<String>;
        let mut created = None::<String>;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match key.trim() {
                "mode" => mode = Some(value.to_string()),
                "parent" if !value.is_empty() => parent = Some(value.to_string()),
                "created" => created = Some(value.to_string()),
                _ => {}
            }
        }

        let mode: Mode = mode
            .ok_or_else(|| Error::msg("manifest has no mode"))?
            .parse()
            .map_err(|e: Error| Error::msg(e.to_string()))?;
        let lineage = match mode {
            Mode::Full => Lineage::Full,
            Mode::Archive => Lineage::Archive,
            Mode::Incremental => Lineage::Incremental {
                parent: parent
                    .ok_or_else(|| Error::msg("incremental manifest has no parent"))?,
            },
        };
        let created = created.and_then(|c| {
            DateTime::parse_from_rfc3339(&c)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        });
        Ok(Self { lineage, created })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn names_sort_chronologically() {
        let a = snapshot_name(Utc.with_ymd_and_hms(2024, 1, 9, 23, 59, 59).unwrap());
        let b = snapshot_name(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        assert_eq!(a, "2024-01-09_23-59-59");
        assert!(a < b);
        assert!(is_snapshot_name(&a));
        assert!(!is_snapshot_name("archive"));
        assert!(!is_snapshot_name("2024-13-01_00-00-00"));
    }

    #[test]
    fn render_then_parse_incremental() {
        let m = Manifest::new(
            Lineage::Incremental {
                parent: "2024-01-01_03-00-00".into(),
            },
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap(),
        );
        let text = m.render();
        assert!(text.contains("created: 2024-01-02T03:00:00Z"));
        assert_eq!(Manifest::parse(&text).expect("parse"), m);
    }

    #[test]
    fn full_manifest_has_no_parent_key() {
        let m = Manifest::new(Lineage::Full, Utc::now());
        assert!(!m.render().contains("parent"));
    }

    #[test]
    fn parse_tolerates_unknown_keys_and_aliases() {
        let m = Manifest::parse("# generated\nhost: nas\nmode: incr\nparent: 2024-01-01_00-00-00\n")
            .expect("parse");
        assert_eq!(m.mode(), Mode::Incremental);
        assert_eq!(m.parent(), Some("2024-01-01_00-00-00"));
        assert_eq!(m.created, None);
    }

    #[test]
    fn parse_rejects_unrepresentable_manifests() {
        assert!(Manifest::parse("created: 2024-01-01T00:00:00Z\n").is_err());
        assert!(Manifest::parse("mode: incremental\n").is_err());
        assert!(Manifest::parse("mode: differential\n").is_err());
    }

    #[test]
    fn parse_ignores_parent_on_full() {
        let m = Manifest::parse("mode: full\nparent: \n").expect("parse");
        assert_eq!(m.lineage, Lineage::Full);
    }

    #[test]
    fn snapshot_date_from_prefix() {
        assert_eq!(
            parse_snapshot_date("2024-03-01_12-00-00"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(parse_snapshot_date("latest"), None);
    }
}
