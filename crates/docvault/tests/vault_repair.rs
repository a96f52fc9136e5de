use std::sync::Arc;

use docvault::Vault;
use docvault::layout::DataLayout;
use docvault::mirror::memory::MemoryMirror;
use docvault::mirror::{CircuitBreaker, DEFAULT_SNAPSHOT_NAME, Mirror};
use docvault::model::{FileType, UploadMeta};
use docvault::snapshot::{self, Snapshot};
use docvault::vault::MirrorOutcome;

fn open(mem: &Arc<MemoryMirror>) -> (tempfile::TempDir, Vault) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mirror = Mirror::new(mem.clone(), Arc::new(CircuitBreaker::default()));
    let vault = Vault::open(DataLayout::under(tmp.path()), mirror).expect("open vault");
    (tmp, vault)
}

const REPORT: &[u8] = b"%PDF-1.4\n%";

#[test]
fn report_round_trips_and_purge_makes_it_unresolvable() {
    let mem = Arc::new(MemoryMirror::new());
    let (_tmp, vault) = open(&mem);
    assert_eq!(REPORT.len(), 10);

    let out = vault
        .commit(REPORT, &UploadMeta::named("report.pdf"))
        .expect("commit");
    let doc = out.document;
    assert_eq!(doc.file_type, FileType::Pdf);
    assert_eq!(doc.title, "report");
    assert_eq!(doc.original_name, "report.pdf");
    assert_ne!(doc.filename, "report.pdf");
    assert!(doc.filename.ends_with(".pdf"));
    assert_eq!(out.mirror, MirrorOutcome::Mirrored);
    assert_eq!(mem.contents(&doc.filename).as_deref(), Some(REPORT));

    let resolved = vault.resolve(&doc.filename).expect("resolve");
    assert_eq!(resolved.bytes, REPORT);
    assert_eq!(resolved.mime, "application/pdf");
    assert!(!resolved.repaired);

    let purged = vault.purge(doc.id).expect("purge");
    assert!(purged.local_removed);
    assert_eq!(purged.mirror, MirrorOutcome::Mirrored);
    assert!(mem.contents(&doc.filename).is_none());
    assert!(vault.resolve(&doc.filename).unwrap_err().is_not_found());
    assert!(vault.get_document(doc.id).unwrap_err().is_not_found());
    assert!(vault.purge(doc.id).unwrap_err().is_not_found());
}

#[test]
fn missing_local_copy_is_repaired_from_mirror() {
    let mem = Arc::new(MemoryMirror::new());
    let (_tmp, vault) = open(&mem);
    let doc = vault
        .commit(b"\x89PNG\r\n\x1a\nimage", &UploadMeta::named("logo.png"))
        .expect("commit")
        .document;
    assert!(vault.store().remove(&doc.filename).expect("remove"));

    let resolved = vault.resolve(&doc.filename).expect("repair");
    assert!(resolved.repaired);
    assert_eq!(resolved.bytes, b"\x89PNG\r\n\x1a\nimage");
    assert!(vault.store().exists(&doc.filename), "repaired copy is cached");
    assert!(!vault.resolve(&doc.filename).expect("again").repaired);
}

#[test]
fn truncated_mirror_copy_is_removed_but_commit_succeeds() {
    let mem = Arc::new(MemoryMirror::new());
    mem.set_truncate_uploads(true);
    let (_tmp, vault) = open(&mem);

    let out = vault
        .commit(REPORT, &UploadMeta::named("report.pdf"))
        .expect("commit still succeeds");
    assert!(matches!(out.mirror, MirrorOutcome::Failed { .. }), "{:?}", out.mirror);
    assert!(mem.contents(&out.document.filename).is_none());
    assert_eq!(
        vault.resolve(&out.document.filename).expect("local").bytes,
        REPORT
    );
    assert!(vault.mirror().write_allowed(), "corruption does not trip the breaker");
}

#[test]
fn purge_with_unreachable_mirror_still_removes_local_state() {
    let mem = Arc::new(MemoryMirror::new());
    let (_tmp, vault) = open(&mem);
    let doc = vault
        .commit(REPORT, &UploadMeta::named("report.pdf"))
        .expect("commit")
        .document;

    mem.set_reachable(false);
    let purged = vault.purge(doc.id).expect("purge");
    assert!(purged.local_removed);
    assert!(matches!(purged.mirror, MirrorOutcome::Failed { .. }));
    assert!(!vault.store().exists(&doc.filename));
    assert!(vault.list_documents(false).expect("docs").is_empty());
    assert!(!vault.mirror().write_allowed());
}

#[test]
fn failing_mirror_remove_is_logged_not_fatal() {
    let mem = Arc::new(MemoryMirror::new());
    let (_tmp, vault) = open(&mem);
    let doc = vault
        .commit(REPORT, &UploadMeta::named("report.pdf"))
        .expect("commit")
        .document;
    mem.set_fail_removes(true);
    let purged = vault.purge(doc.id).expect("purge");
    assert!(matches!(purged.mirror, MirrorOutcome::Failed { .. }));
    assert!(vault.get_document(doc.id).unwrap_err().is_not_found());
}

#[test]
fn purged_file_left_on_mirror_stays_deleted() {
    let mem = Arc::new(MemoryMirror::new());
    let (_tmp, vault) = open(&mem);
    let doc = vault
        .commit(REPORT, &UploadMeta::named("report.pdf"))
        .expect("commit")
        .document;
    mem.set_fail_removes(true);
    vault.purge(doc.id).expect("purge");
    assert!(mem.contents(&doc.filename).is_some(), "mirror copy left behind");

    assert!(vault.resolve(&doc.filename).unwrap_err().is_not_found());
    assert!(!vault.store().exists(&doc.filename), "nothing cached");
}

#[test]
fn snapshot_control_file_is_never_served() {
    let mem = Arc::new(MemoryMirror::new());
    let (_tmp, vault) = open(&mem);
    let hidden = UploadMeta {
        is_visible: false,
        ..UploadMeta::named("secret.pdf")
    };
    vault.commit(REPORT, &hidden).expect("commit");
    assert!(mem.contents(DEFAULT_SNAPSHOT_NAME).is_some());

    let err = vault.resolve(DEFAULT_SNAPSHOT_NAME).unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert!(!vault.store().exists(DEFAULT_SNAPSHOT_NAME));
    assert!(!vault.store().dir().join(DEFAULT_SNAPSHOT_NAME).exists());
    assert_eq!(vault.stats().expect("stats").uploads_files, 1);
    assert!(vault.resolve(".ftpquota").is_err());
}

#[test]
fn unreachable_mirror_suspends_writes_until_reset() {
    let mem = Arc::new(MemoryMirror::new());
    let (_tmp, vault) = open(&mem);
    let old = vault
        .commit(REPORT, &UploadMeta::named("old.pdf"))
        .expect("commit")
        .document;

    mem.set_reachable(false);
    let first = vault
        .commit(REPORT, &UploadMeta::named("a.pdf"))
        .expect("local commit");
    assert!(matches!(first.mirror, MirrorOutcome::Failed { .. }));

    mem.set_reachable(true);
    let opens = mem.open_count();
    let second = vault
        .commit(REPORT, &UploadMeta::named("b.pdf"))
        .expect("local commit");
    assert!(matches!(second.mirror, MirrorOutcome::Skipped { .. }));
    assert_eq!(mem.open_count(), opens, "no write attempted while suspended");

    // Reads still go to the mirror.
    vault.store().remove(&old.filename).expect("lose local copy");
    assert!(vault.resolve(&old.filename).expect("repair").repaired);

    vault.mirror().breaker().reset();
    let third = vault
        .commit(REPORT, &UploadMeta::named("c.pdf"))
        .expect("commit");
    assert_eq!(third.mirror, MirrorOutcome::Mirrored);
}

#[test]
fn mutations_save_snapshot_locally_and_on_mirror() {
    let mem = Arc::new(MemoryMirror::new());
    let (_tmp, vault) = open(&mem);
    let doc = vault
        .commit(REPORT, &UploadMeta::named("report.pdf"))
        .expect("commit")
        .document;

    let local = snapshot::load_local(&vault.layout().snapshot_path).expect("local snapshot");
    assert_eq!(local.documents.len(), 1);
    assert_eq!(local.documents[0].filename, doc.filename);

    let remote = Snapshot::from_bytes(&mem.contents(DEFAULT_SNAPSHOT_NAME).expect("remote"))
        .expect("parse");
    assert_eq!(remote.timestamp, local.timestamp);
    assert!(remote.same_content(&local));
    assert!(
        vault
            .mirror()
            .list()
            .expect("list")
            .iter()
            .all(|e| e.name != DEFAULT_SNAPSHOT_NAME)
    );
}

#[test]
fn local_only_vault_works_without_mirror() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let vault = Vault::open(DataLayout::under(tmp.path()), Mirror::disabled()).expect("open");
    let out = vault
        .commit(REPORT, &UploadMeta::named("report.pdf"))
        .expect("commit");
    assert!(matches!(out.mirror, MirrorOutcome::Skipped { .. }));
    assert!(vault.resolve("never-stored.pdf").unwrap_err().is_not_found());
    assert!(!vault.stats().expect("stats").mirror.configured);
}
