mod common;

use std::fs;

use common::{FakeDb, FakeStack, Instance, at, have_tar};
use stackvault::catalog::{Catalog, StatusMarker, Tier, describe};
use stackvault::manifest::Mode;
use stackvault::verify::verify_checksums;
use stackvault::writer::Writer;

fn catalog(inst: &Instance) -> Catalog {
    Catalog::load(
        &inst.remote,
        &inst.settings.remote.standard_path,
        &inst.settings.remote.archive_path,
    )
    .expect("catalog")
}

#[test]
fn full_snapshot_resolves_to_itself() {
    let inst = Instance::new();
    let db = FakeDb::default();
    let stack = FakeStack::default();
    let w = Writer::new(&inst.settings, &inst.remote, &db, &stack);

    let report = w
        .write_snapshot_at(Mode::Full, at(2024, 1, 1, 3))
        .expect("write");
    assert_eq!(report.name, "2024-01-01_03-00-00");
    assert!(report.verified());

    let snap = inst.standard(&report.name);
    for f in [
        "manifest.yaml",
        "postgres.sql",
        ".env",
        "compose.snapshot.yml",
        "docker-images.txt",
        "SHA256SUMS",
        "status.ok",
    ] {
        assert!(snap.join(f).is_file(), "missing {f}");
    }
    assert!(verify_checksums(&snap).expect("checksums"));

    let chain = catalog(&inst).resolve_chain(&report.name).expect("chain");
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].name, report.name);
    assert_eq!(chain[0].mode(), Some(Mode::Full));
}

#[test]
fn incremental_on_empty_catalog_is_written_as_full() {
    let inst = Instance::new();
    let db = FakeDb::default();
    let stack = FakeStack::default();
    let w = Writer::new(&inst.settings, &inst.remote, &db, &stack);

    let report = w
        .write_snapshot_at(Mode::Incremental, at(2024, 1, 1, 3))
        .expect("write");
    assert_eq!(report.requested, Mode::Incremental);
    assert_eq!(report.mode, Mode::Full);
    assert_eq!(report.parent, None);

    let manifest =
        fs::read_to_string(inst.standard(&report.name).join("manifest.yaml")).expect("manifest");
    assert!(manifest.contains("mode: full"));
    assert!(!manifest.contains("parent"));
}

#[test]
fn incremental_parent_is_latest_standard_snapshot() {
    let inst = Instance::new();
    let db = FakeDb::default();
    let stack = FakeStack::default();
    let w = Writer::new(&inst.settings, &inst.remote, &db, &stack);

    let full = w.write_snapshot_at(Mode::Full, at(2024, 1, 1, 3)).expect("full");
    let incr = w
        .write_snapshot_at(Mode::Incremental, at(2024, 1, 2, 3))
        .expect("incr");
    let archive = w
        .write_snapshot_at(Mode::Archive, at(2024, 1, 3, 3))
        .expect("archive");
    let next = w
        .write_snapshot_at(Mode::Incremental, at(2024, 1, 4, 3))
        .expect("incr 2");

    assert_eq!(incr.parent.as_deref(), Some(full.name.as_str()));
    assert_eq!(archive.parent, None);
    assert!(inst.archived(&archive.name).join("manifest.yaml").is_file());
    assert!(archive.retention.is_none());
    assert_eq!(next.parent.as_deref(), Some(incr.name.as_str()));

    let cat = catalog(&inst);
    assert_eq!(cat.get(&archive.name).map(|e| e.tier), Some(Tier::Archive));
    let chain = cat.resolve_chain(&next.name).expect("chain");
    let names: Vec<&str> = chain.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec![full.name.as_str(), incr.name.as_str(), next.name.as_str()]);
    assert!(matches!(chain[0].mode(), Some(Mode::Full) | Some(Mode::Archive)));
    for pair in chain.windows(2) {
        assert_eq!(pair[1].parent(), Some(pair[0].name.as_str()));
    }
}

#[test]
fn failed_dump_still_uploads_a_data_only_snapshot() {
    let inst = Instance::new();
    let db = FakeDb {
        fail_dump: true,
        ..FakeDb::default()
    };
    let stack = FakeStack::default();
    let report = Writer::new(&inst.settings, &inst.remote, &db, &stack)
        .write_snapshot_at(Mode::Full, at(2024, 1, 1, 3))
        .expect("write");

    let snap = inst.standard(&report.name);
    assert!(snap.join("manifest.yaml").is_file());
    assert!(!snap.join("postgres.sql").exists());
    assert!(report.warnings.iter().any(|w| w.contains("database dump failed")));
    // No dump means the database check passes vacuously.
    assert!(report.verified());
    assert_eq!(db.verified.get(), 0);
}

#[test]
fn failed_verification_is_uploaded_with_fail_marker() {
    let inst = Instance::new();
    let db = FakeDb {
        fail_verify: true,
        ..FakeDb::default()
    };
    let stack = FakeStack::default();
    let report = Writer::new(&inst.settings, &inst.remote, &db, &stack)
        .write_snapshot_at(Mode::Full, at(2024, 1, 1, 3))
        .expect("write");

    assert!(!report.verified());
    let snap = inst.standard(&report.name);
    assert!(snap.join("status.fail").is_file());
    assert!(!snap.join("status.ok").exists());
    let body = fs::read_to_string(snap.join("status.fail")).expect("status");
    assert!(body.contains("relation does not exist"), "{body}");
}

#[test]
fn duplicate_snapshot_name_is_refused() {
    let inst = Instance::new();
    let db = FakeDb::default();
    let stack = FakeStack::default();
    let w = Writer::new(&inst.settings, &inst.remote, &db, &stack);
    w.write_snapshot_at(Mode::Full, at(2024, 1, 1, 3)).expect("first");
    assert!(w.write_snapshot_at(Mode::Full, at(2024, 1, 1, 3)).is_err());
}

#[test]
fn staging_is_removed_when_upload_fails() {
    let inst = Instance::new();
    let db = FakeDb::default();
    let stack = FakeStack::default();
    // A plain file where the snapshot directory should go makes the upload
    // fail after the payload was staged and verified.
    let blocker = inst.standard("2024-01-01_03-00-00");
    fs::create_dir_all(blocker.parent().expect("parent")).expect("mkdir");
    fs::write(&blocker, "in the way").expect("write");

    let err = Writer::new(&inst.settings, &inst.remote, &db, &stack)
        .write_snapshot_at(Mode::Full, at(2024, 1, 1, 3))
        .expect_err("upload onto a file");
    assert!(err.to_string().contains("upload of 2024-01-01_03-00-00"), "{err}");
    assert_eq!(db.verified.get(), 1);

    let staging = &inst.settings.staging_parent;
    assert!(staging.is_dir());
    let leftovers: Vec<_> = fs::read_dir(staging)
        .expect("read_dir")
        .map(|e| e.expect("entry").file_name())
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn detail_reports_status_images_and_size() {
    let inst = Instance::new();
    let db = FakeDb::default();
    let stack = FakeStack::default();
    let report = Writer::new(&inst.settings, &inst.remote, &db, &stack)
        .write_snapshot_at(Mode::Full, at(2024, 1, 1, 3))
        .expect("write");

    let cat = catalog(&inst);
    let entry = cat.get(&report.name).expect("entry");
    let detail = describe(&inst.remote, &cat, entry).expect("describe");
    assert_eq!(detail.status, StatusMarker::Ok);
    assert!(detail.has_images);
    assert!(detail.size.files >= 7, "{:?}", detail.size);
    assert!(detail.size.bytes > 0);
}

#[test]
fn tracked_directories_are_archived_and_tokens_carried_forward() {
    if !have_tar() {
        return;
    }
    let inst = Instance::new();
    let media = inst.dir("media");
    fs::create_dir_all(&media).expect("mkdir");
    fs::write(media.join("scan-001.pdf"), "pdf").expect("write");

    let db = FakeDb::default();
    let stack = FakeStack::default();
    let w = Writer::new(&inst.settings, &inst.remote, &db, &stack);
    let full = w.write_snapshot_at(Mode::Full, at(2024, 1, 1, 3)).expect("full");
    assert_eq!(full.archives, vec!["media".to_string()]);
    assert!(full.warnings.iter().any(|w| w.contains("data: directory missing")));

    let snap = inst.standard(&full.name);
    assert!(snap.join("media.tar.gz").is_file());
    assert!(snap.join("media.snar").is_file());
    assert!(!snap.join("data.tar.gz").exists());

    fs::write(media.join("scan-002.pdf"), "pdf2").expect("write");
    let incr = w
        .write_snapshot_at(Mode::Incremental, at(2024, 1, 2, 3))
        .expect("incr");
    assert_eq!(incr.mode, Mode::Incremental);
    assert!(
        !incr
            .warnings
            .iter()
            .any(|w| w.contains("change-state tokens")),
        "{:?}",
        incr.warnings
    );
    assert!(inst.standard(&incr.name).join("media.snar").is_file());
}
