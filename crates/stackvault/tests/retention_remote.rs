mod common;

use common::{Instance, at};
use stackvault::ErrorKind;
use stackvault::catalog::Catalog;
use stackvault::retention::{RetentionPolicy, apply_retention};

const FULL: &str = "mode: full\n";

fn seed(inst: &Instance) {
    for name in [
        "2024-06-10_03-00-00",
        "2024-05-16_03-00-00",
        "2024-05-01_03-00-00",
    ] {
        inst.plant(&format!("backups/test/{name}"), Some(FULL));
    }
    for name in [
        "2024-06-01_03-00-00",
        "2024-03-01_03-00-00",
        "2024-03-02_03-00-00",
        "2023-11-01_03-00-00",
        "notes",
    ] {
        inst.plant(&format!("backups/test/archive/{name}"), Some("mode: archive\n"));
    }
}

fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}

#[test]
fn retention_prunes_both_tiers_and_is_idempotent() {
    let inst = Instance::new();
    seed(&inst);
    let policy = RetentionPolicy::default();
    let now = at(2024, 6, 15, 12);

    let report = apply_retention(
        &inst.remote,
        "backups/test",
        "backups/test/archive",
        &policy,
        now,
    )
    .expect("retention");
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(
        sorted(report.deleted),
        vec![
            "backups/test/2024-05-01_03-00-00".to_string(),
            "backups/test/archive/2023-11-01_03-00-00".to_string(),
            "backups/test/archive/2024-03-02_03-00-00".to_string(),
        ]
    );

    assert!(inst.standard("2024-05-16_03-00-00").is_dir());
    assert!(inst.standard("2024-06-10_03-00-00").is_dir());
    assert!(!inst.standard("2024-05-01_03-00-00").exists());
    assert!(inst.archived("2024-03-01_03-00-00").is_dir());
    assert!(inst.archived("2024-06-01_03-00-00").is_dir());
    assert!(inst.archived("notes").is_dir());

    let again = apply_retention(
        &inst.remote,
        "backups/test",
        "backups/test/archive",
        &policy,
        now,
    )
    .expect("retention again");
    assert!(again.deleted.is_empty());
    assert!(again.is_clean());
}

#[test]
fn zero_windows_disable_deletion() {
    let inst = Instance::new();
    seed(&inst);
    let policy = RetentionPolicy {
        keep_all_days: 0,
        keep_monthly_days: 0,
    };
    let report = apply_retention(
        &inst.remote,
        "backups/test",
        "backups/test/archive",
        &policy,
        at(2030, 1, 1, 0),
    )
    .expect("retention");
    assert!(report.deleted.is_empty());
    assert!(inst.standard("2024-05-01_03-00-00").is_dir());
    assert!(inst.archived("2023-11-01_03-00-00").is_dir());
}

#[test]
fn pruning_a_parent_breaks_dependent_chains_visibly() {
    let inst = Instance::new();
    inst.plant("backups/test/2024-05-01_03-00-00", Some(FULL));
    inst.plant(
        "backups/test/2024-06-10_03-00-00",
        Some("mode: incremental\nparent: 2024-05-01_03-00-00\n"),
    );
    apply_retention(
        &inst.remote,
        "backups/test",
        "backups/test/archive",
        &RetentionPolicy::default(),
        at(2024, 6, 15, 12),
    )
    .expect("retention");

    let cat = Catalog::load(&inst.remote, "backups/test", "backups/test/archive").expect("catalog");
    let err = cat
        .resolve_chain("2024-06-10_03-00-00")
        .expect_err("orphaned incremental");
    assert_eq!(err.kind(), ErrorKind::ChainCorrupt);
}

#[test]
fn missing_roots_are_an_empty_catalog() {
    let inst = Instance::new();
    let report = apply_retention(
        &inst.remote,
        "backups/test",
        "backups/test/archive",
        &RetentionPolicy::default(),
        at(2024, 6, 15, 12),
    )
    .expect("retention");
    assert!(report.deleted.is_empty() && report.kept.is_empty());
    let cat = Catalog::load(&inst.remote, "backups/test", "backups/test/archive").expect("catalog");
    assert!(cat.is_empty());
}
