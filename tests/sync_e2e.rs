//! End-to-end reconciliation scenarios against scripted remotes

use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arcsync::archive;
use arcsync::dir_remote::DirRemote;
use arcsync::engine::{Granularity, SyncError, Syncer};
use arcsync::hierarchy::RemoteAddress;
use arcsync::ledger::SubtreeKey;
use arcsync::logger::{NoopLogger, SyncLogger};
use arcsync::remote::{
    ExperimentEntry, FileEntry, ImportPolicy, ProjectListing, RemoteError, RemoteStore,
    ResourceEntry, ScanEntry, SubjectEntry,
};
use arcsync::session::{self, SessionError};
use arcsync::testutil::FakeRemote;

fn scan(id: &str, scan_type: &str, files: &[&str]) -> ScanEntry {
    ScanEntry {
        id: id.into(),
        scan_type: scan_type.into(),
        resources: vec![ResourceEntry {
            id: "DICOM".into(),
            label: "DICOM".into(),
            files: files
                .iter()
                .map(|f| FileEntry {
                    id: (*f).to_string(),
                    name: (*f).to_string(),
                })
                .collect(),
        }],
    }
}

fn listing() -> ProjectListing {
    ProjectListing {
        id: "ProjA".into(),
        subjects: vec![
            SubjectEntry {
                id: "S_001".into(),
                label: "Sub1".into(),
                experiments: vec![ExperimentEntry {
                    id: "E7".into(),
                    label: "Sub1_MR1".into(),
                    scans: vec![
                        scan("1", "T1 weighted", &["E7-001.dcm", "E7-002.dcm"]),
                        scan("2", "DTI", &["dti.dcm"]),
                    ],
                }],
            },
            SubjectEntry {
                id: "S_002".into(),
                label: "Sub2".into(),
                experiments: vec![ExperimentEntry {
                    id: "E8".into(),
                    label: "Sub2_MR1".into(),
                    scans: vec![scan("1", "T1 weighted", &["E8-001.dcm"])],
                }],
            },
        ],
    }
}

fn staged_remote() -> FakeRemote {
    let remote = FakeRemote::new(listing());
    let p = RemoteAddress::project("ProjA");
    let r1 = p.child("S_001").child("E7").child("1").child("DICOM");
    remote.stage_file(&r1.child("E7-001.dcm"), b"one");
    remote.stage_file(&r1.child("E7-002.dcm"), b"two");
    let r2 = p.child("S_001").child("E7").child("2").child("DICOM");
    remote.stage_file(&r2.child("dti.dcm"), b"dti");
    let r3 = p.child("S_002").child("E8").child("1").child("DICOM");
    remote.stage_file(&r3.child("E8-001.dcm"), b"sub2");
    remote
}

fn sub1_t1(root: &Path) -> std::path::PathBuf {
    root.join("ProjA/Sub1/Sub1_MR1/scans/1-T1_weighted/resources/DICOM/files")
}

#[test]
fn fresh_root_pulls_whole_project_in_one_archive() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");

    let syncer = Syncer::new(&remote, &root, &NoopLogger);
    let report = syncer.pull("ProjA").expect("pull");

    assert_eq!(remote.calls.archives(), 1);
    assert_eq!(report.transferred, 1);
    assert!(!report.has_failures());

    // experiment-id prefixes relabeled, scan types slugged
    assert_eq!(
        fs::read(sub1_t1(&root).join("Sub1_MR1-001.dcm")).expect("read"),
        b"one"
    );
    assert_eq!(
        fs::read(sub1_t1(&root).join("Sub1_MR1-002.dcm")).expect("read"),
        b"two"
    );
    assert_eq!(
        fs::read(root.join("ProjA/Sub1/Sub1_MR1/scans/2-DTI/resources/DICOM/files/dti.dcm"))
            .expect("read"),
        b"dti"
    );
    assert_eq!(
        fs::read(
            root.join("ProjA/Sub2/Sub2_MR1/scans/1-T1_weighted/resources/DICOM/files/Sub2_MR1-001.dcm")
        )
        .expect("read"),
        b"sub2"
    );
}

#[test]
fn populated_subject_is_left_alone() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");

    // Sub2 has local content already; whatever is inside counts as synced
    let marker = root.join("ProjA/Sub2/old_session");
    fs::create_dir_all(&marker).expect("mkdirs");
    fs::write(marker.join("keep.txt"), b"local-only").expect("write");

    let syncer = Syncer::new(&remote, &root, &NoopLogger);
    let report = syncer.pull("ProjA").expect("pull");

    // one archive for Sub1, none for Sub2, and no finer probing below it
    assert_eq!(remote.calls.archives(), 1);
    assert_eq!(remote.calls.files(), 0);
    assert_eq!(report.transferred, 1);
    assert_eq!(report.satisfied, 1);
    assert!(syncer.ledger().is_resolved(&SubtreeKey::Subject("Sub2".into())));

    // Sub2 was never re-downloaded or touched
    assert_eq!(fs::read(marker.join("keep.txt")).expect("read"), b"local-only");
    assert!(!root.join("ProjA/Sub2/Sub2_MR1").exists());
    // Sub1 landed in full
    assert!(sub1_t1(&root).join("Sub1_MR1-001.dcm").is_file());
}

#[test]
fn second_run_downloads_nothing() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");

    Syncer::new(&remote, &root, &NoopLogger)
        .pull("ProjA")
        .expect("first pull");
    let after_first = remote.calls.archives();

    let report = Syncer::new(&remote, &root, &NoopLogger)
        .pull("ProjA")
        .expect("second pull");

    assert_eq!(remote.calls.archives(), after_first);
    assert_eq!(remote.calls.files(), 0);
    assert_eq!(report.transferred, 0);
    assert!(!report.has_failures());
}

#[test]
fn failed_subject_bulk_resolves_by_descent() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");
    // project dir populated so the walk reaches individual subjects
    fs::create_dir_all(root.join("ProjA")).expect("mkdirs");
    fs::write(root.join("ProjA/.placeholder"), b"").expect("write");

    let sub1 = RemoteAddress::project("ProjA").child("S_001");
    remote.fail_bulk_at(&sub1);

    let syncer = Syncer::new(&remote, &root, &NoopLogger);
    let report = syncer.pull("ProjA").expect("pull");

    assert!(!report.has_failures());
    // subject archive failed once, its one experiment landed whole, Sub2
    // still moved as a single subject archive
    assert_eq!(remote.calls.archives(), 3);
    assert!(syncer.ledger().is_resolved(&SubtreeKey::Subject("Sub1".into())));

    // same files a successful bulk would have produced
    assert_eq!(
        fs::read(sub1_t1(&root).join("Sub1_MR1-001.dcm")).expect("read"),
        b"one"
    );
    assert!(root
        .join("ProjA/Sub1/Sub1_MR1/scans/2-DTI/resources/DICOM/files/dti.dcm")
        .is_file());

    // rerun with the fault gone: the tree already probes complete
    remote.clear_bulk_failures();
    let before = remote.calls.archives();
    Syncer::new(&remote, &root, &NoopLogger)
        .pull("ProjA")
        .expect("rerun");
    assert_eq!(remote.calls.archives(), before);
}

#[test]
fn resource_floor_surfaces_unresolved_subtrees() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");
    fs::create_dir_all(root.join("ProjA")).expect("mkdirs");
    fs::write(root.join("ProjA/.placeholder"), b"").expect("write");

    // every archive under Sub1 fails; default granularity stops at
    // resource rank, so those subtrees stay unresolved
    remote.fail_bulk_under(&RemoteAddress::project("ProjA").child("S_001"));

    let syncer = Syncer::new(&remote, &root, &NoopLogger);
    let report = syncer.pull("ProjA").expect("pull");

    assert!(report.has_failures());
    assert_eq!(remote.calls.files(), 0);
    // no partially-extracted content left behind for Sub1
    assert!(!root.join("ProjA/Sub1").exists());
    // the healthy sibling still landed
    assert!(root
        .join("ProjA/Sub2/Sub2_MR1/scans/1-T1_weighted/resources/DICOM/files/Sub2_MR1-001.dcm")
        .is_file());
}

#[test]
fn file_granularity_falls_back_to_per_file_transfers() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");
    fs::create_dir_all(root.join("ProjA")).expect("mkdirs");
    fs::write(root.join("ProjA/.placeholder"), b"").expect("write");

    remote.fail_bulk_under(&RemoteAddress::project("ProjA").child("S_001"));

    let syncer =
        Syncer::new(&remote, &root, &NoopLogger).with_granularity(Granularity::Files);
    let report = syncer.pull("ProjA").expect("pull");

    assert!(!report.has_failures());
    // all three Sub1 files fetched individually
    assert_eq!(remote.calls.files(), 3);
    assert_eq!(
        fs::read(sub1_t1(&root).join("Sub1_MR1-002.dcm")).expect("read"),
        b"two"
    );
}

#[test]
fn parallel_subject_workers_produce_the_same_tree() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");
    fs::create_dir_all(root.join("ProjA")).expect("mkdirs");
    fs::write(root.join("ProjA/.placeholder"), b"").expect("write");

    let syncer = Syncer::new(&remote, &root, &NoopLogger).with_threads(2);
    let report = syncer.pull("ProjA").expect("pull");

    assert!(!report.has_failures());
    assert_eq!(report.transferred, 2);
    assert!(sub1_t1(&root).join("Sub1_MR1-001.dcm").is_file());
    assert!(root
        .join("ProjA/Sub2/Sub2_MR1/scans/1-T1_weighted/resources/DICOM/files/Sub2_MR1-001.dcm")
        .is_file());
}

/// Trips a cancellation flag as soon as the first bulk transfer lands.
struct TripAfterBulk {
    cancel: Arc<AtomicBool>,
}

impl SyncLogger for TripAfterBulk {
    fn bulk_done(&self, _uri: &str, _path: &Path) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

#[test]
fn cancellation_stops_between_subjects() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");
    fs::create_dir_all(root.join("ProjA")).expect("mkdirs");
    fs::write(root.join("ProjA/.placeholder"), b"").expect("write");

    let cancel = Arc::new(AtomicBool::new(false));
    let logger = TripAfterBulk {
        cancel: cancel.clone(),
    };
    let syncer = Syncer::new(&remote, &root, &logger).with_cancel(cancel);
    let report = syncer.pull("ProjA").expect("pull");

    assert!(report.cancelled);
    // Sub1's in-flight transfer finished; Sub2 was never probed or fetched
    assert_eq!(report.transferred, 1);
    assert_eq!(remote.calls.archives(), 1);
    assert_eq!(report.probes, 2);
    assert!(sub1_t1(&root).join("Sub1_MR1-001.dcm").is_file());
    assert!(!root.join("ProjA/Sub2").exists());
}

/// Takes the remote down as soon as the first bulk transfer lands.
struct OutageAfterBulk<'a> {
    remote: &'a FakeRemote,
}

impl SyncLogger for OutageAfterBulk<'_> {
    fn bulk_done(&self, _uri: &str, _path: &Path) {
        self.remote.set_down(true);
    }
}

#[test]
fn mid_run_outage_aborts_without_visiting_remaining_subjects() {
    let mut with_third = listing();
    with_third.subjects.push(SubjectEntry {
        id: "S_003".into(),
        label: "Sub3".into(),
        experiments: vec![ExperimentEntry {
            id: "E9".into(),
            label: "Sub3_MR1".into(),
            scans: vec![scan("1", "T1 weighted", &["E9-001.dcm"])],
        }],
    });
    let remote = FakeRemote::new(with_third);

    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");
    fs::create_dir_all(root.join("ProjA")).expect("mkdirs");
    fs::write(root.join("ProjA/.placeholder"), b"").expect("write");

    let logger = OutageAfterBulk { remote: &remote };
    let err = Syncer::new(&remote, &root, &logger)
        .pull("ProjA")
        .expect_err("outage is fatal");
    assert!(matches!(err, SyncError::Remote(RemoteError::Fatal(_))));

    // Sub1 landed, Sub2's attempt hit the outage, Sub3 was never reached
    assert_eq!(remote.calls.archives(), 2);
    assert_eq!(remote.calls.files(), 0);
    assert!(!root.join("ProjA/Sub3").exists());
}

#[test]
fn unreachable_remote_aborts_the_run() {
    let remote = staged_remote();
    remote.set_down(true);
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");

    let err = Syncer::new(&remote, &root, &NoopLogger)
        .pull("ProjA")
        .expect_err("remote is down");
    assert!(matches!(
        err,
        SyncError::Remote(RemoteError::Fatal(_))
    ));
}

#[test]
fn unknown_project_is_an_error() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");

    let err = Syncer::new(&remote, &root, &NoopLogger)
        .pull("Nope")
        .expect_err("no such project");
    assert!(matches!(
        err,
        SyncError::Remote(RemoteError::NotFound(_))
    ));
}

#[test]
fn plan_lists_pending_subtrees_without_transferring() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");

    let syncer = Syncer::new(&remote, &root, &NoopLogger);
    let pending = syncer.plan("ProjA").expect("plan");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].labels(), &["ProjA".to_string()]);
    assert_eq!(remote.calls.archives(), 0);

    syncer.pull("ProjA").expect("pull");
    let pending = Syncer::new(&remote, &root, &NoopLogger)
        .plan("ProjA")
        .expect("plan");
    assert!(pending.is_empty());
}

fn stage_local_session(root: &Path, subject: &str, session: &str, file: &str) {
    let files = root.join(format!(
        "ProjA/{subject}/{session}/scans/1-T2_weighted/resources/DICOM/files"
    ));
    fs::create_dir_all(&files).expect("mkdirs");
    fs::write(files.join(file), b"upload me").expect("write");
}

#[test]
fn push_skips_existing_subjects_wholesale() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");

    // Sub1 is already on the remote; Sub9 is new local work
    fs::create_dir_all(root.join("ProjA/Sub1")).expect("mkdirs");
    stage_local_session(&root, "Sub9", "Exp9", "a.dcm");

    let syncer = Syncer::new(&remote, &root, &NoopLogger);
    let report = syncer.push("ProjA").expect("push");

    assert!(!report.has_failures());
    assert_eq!(report.satisfied, 1);
    assert_eq!(report.transferred, 1);
    // one existence query per subject, nothing finer
    assert_eq!(remote.calls.existence_queries(), 2);
    assert_eq!(remote.calls.imports(), 1);
    // pre-existing remote content untouched
    assert!(remote.mutations().is_empty());
    assert!(syncer.ledger().is_resolved(&SubtreeKey::Subject("Sub1".into())));

    // the new session is now listed and queryable
    assert!(remote
        .exists(
            &RemoteAddress::project("ProjA")
                .child("Sub9")
                .child("Exp9")
                .child("1")
                .child("DICOM")
                .child("a.dcm")
        )
        .expect("exists"));
}

#[test]
fn push_without_local_project_dir_is_an_error() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");

    let err = Syncer::new(&remote, &root, &NoopLogger)
        .push("ProjA")
        .expect_err("nothing local to push");
    assert!(matches!(err, SyncError::MissingLocal(_)));
}

#[test]
fn failed_subject_import_descends_to_sessions() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");
    stage_local_session(&root, "Sub9", "Exp9", "a.dcm");

    // subject-level imports fail; session-level imports still work
    remote.fail_bulk_at(&RemoteAddress::project("ProjA"));

    let syncer = Syncer::new(&remote, &root, &NoopLogger);
    let report = syncer.push("ProjA").expect("push");

    assert!(!report.has_failures());
    assert_eq!(remote.calls.imports(), 2);
    assert!(remote.mutations().is_empty());
    assert!(syncer.ledger().is_resolved(&SubtreeKey::Subject("Sub9".into())));
    assert!(remote
        .exists(&RemoteAddress::project("ProjA").child("Sub9").child("Exp9"))
        .expect("exists"));
}

#[test]
fn dir_remote_round_trip() {
    let store_dir = tempfile::tempdir().expect("tempdir");
    let remote = DirRemote::new(store_dir.path());
    remote.create_project(&listing()).expect("create");

    let p = RemoteAddress::project("ProjA");
    remote
        .put_file(
            &p.child("S_001").child("E7").child("1").child("DICOM").child("E7-001.dcm"),
            b"one",
        )
        .expect("stage");
    remote
        .put_file(
            &p.child("S_001").child("E7").child("1").child("DICOM").child("E7-002.dcm"),
            b"two",
        )
        .expect("stage");
    remote
        .put_file(
            &p.child("S_001").child("E7").child("2").child("DICOM").child("dti.dcm"),
            b"dti",
        )
        .expect("stage");
    remote
        .put_file(
            &p.child("S_002").child("E8").child("1").child("DICOM").child("E8-001.dcm"),
            b"sub2",
        )
        .expect("stage");

    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");
    let report = Syncer::new(&remote, &root, &NoopLogger)
        .pull("ProjA")
        .expect("pull");
    assert!(!report.has_failures());
    assert_eq!(
        fs::read(sub1_t1(&root).join("Sub1_MR1-001.dcm")).expect("read"),
        b"one"
    );

    // grow the local tree and push the new session back
    stage_local_session(&root, "Sub9", "Exp9", "new.dcm");
    let report = Syncer::new(&remote, &root, &NoopLogger)
        .push("ProjA")
        .expect("push");
    assert!(!report.has_failures());

    let updated = remote.project("ProjA").expect("listing");
    assert!(updated.subject_by_label("Sub9").is_some());
    // the original remote body survived the round trip
    let mut body = Vec::new();
    remote
        .fetch_file(&p.child("S_001").child("E7").child("1").child("DICOM").child("E7-001.dcm"))
        .expect("fetch")
        .read_to_end(&mut body)
        .expect("read");
    assert_eq!(body, b"one");
}

#[test]
fn push_never_rewrites_existing_remote_content() {
    // pushing a tree that mirrors existing remote content must not rewrite
    // any of it, even when local bodies differ
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("local");

    let files = sub1_t1(&root);
    fs::create_dir_all(&files).expect("mkdirs");
    fs::write(files.join("Sub1_MR1-001.dcm"), b"locally edited").expect("write");

    Syncer::new(&remote, &root, &NoopLogger)
        .push("ProjA")
        .expect("push");
    assert!(remote.mutations().is_empty());

    let mut body = Vec::new();
    remote
        .fetch_file(
            &RemoteAddress::project("ProjA")
                .child("S_001")
                .child("E7")
                .child("1")
                .child("DICOM")
                .child("E7-001.dcm"),
        )
        .expect("fetch")
        .read_to_end(&mut body)
        .expect("read");
    assert_eq!(body, b"one");
}

#[test]
fn grab_writes_one_session_archive() {
    let remote = staged_remote();
    let dest = tempfile::tempdir().expect("tempdir");

    let path = session::grab(&remote, "ProjA", "Sub1_MR1", dest.path()).expect("grab");
    assert_eq!(path, dest.path().join("Sub1_MR1.tar"));

    let out = tempfile::tempdir().expect("tempdir");
    archive::extract_tar(fs::File::open(&path).expect("open"), out.path()).expect("extract");
    assert_eq!(
        fs::read(
            out.path()
                .join("Sub1_MR1/scans/1-T1_weighted/resources/DICOM/files/Sub1_MR1-001.dcm")
        )
        .expect("read"),
        b"one"
    );
}

#[test]
fn grab_exit_codes_follow_the_script_conventions() {
    let remote = staged_remote();
    let dest = tempfile::tempdir().expect("tempdir");

    let err = session::grab(&remote, "Nope", "Sub1_MR1", dest.path()).expect_err("no project");
    assert!(matches!(err, SessionError::UnknownProject(_)));
    assert_eq!(err.exit_code(), 1);

    let err = session::grab(&remote, "ProjA", "NoSuch", dest.path()).expect_err("no session");
    assert!(matches!(err, SessionError::UnknownSession(_)));
    assert_eq!(err.exit_code(), 2);

    remote.set_down(true);
    let err = session::grab(&remote, "ProjA", "Sub1_MR1", dest.path()).expect_err("down");
    assert!(matches!(err, SessionError::Unavailable(_)));
    assert_eq!(err.exit_code(), 9);
}

#[test]
fn put_refuses_sessions_the_remote_already_has() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");

    let dir = tmp.path().join("Sub1_MR1");
    fs::create_dir_all(&dir).expect("mkdirs");
    let err = session::put(&remote, "ProjA", "Sub1", &dir).expect_err("already exists");
    assert!(matches!(err, SessionError::AlreadyExists(_)));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(remote.calls.imports(), 0);

    let err =
        session::put(&remote, "ProjA", "Sub1", &tmp.path().join("nope")).expect_err("missing");
    assert!(matches!(err, SessionError::MissingLocal(_)));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn put_imports_new_sessions_append_only() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().join("Exp9");
    let files = dir.join("scans/1-T2_weighted/resources/DICOM/files");
    fs::create_dir_all(&files).expect("mkdirs");
    fs::write(files.join("a.dcm"), b"x").expect("write");

    let label = session::put(&remote, "ProjA", "Sub1", &dir).expect("put");
    assert_eq!(label, "Exp9");
    assert!(remote.mutations().is_empty());
    assert!(remote
        .exists(
            &RemoteAddress::project("ProjA")
                .child("S_001")
                .child("Exp9")
        )
        .expect("exists"));
}

#[test]
fn overwrite_policy_replaces_bodies_on_demand() {
    let remote = staged_remote();
    let tmp = tempfile::tempdir().expect("tempdir");
    let sub = tmp.path().join("Sub1");
    let files = sub.join("Sub1_MR1/scans/1-T1_weighted/resources/DICOM/files");
    fs::create_dir_all(&files).expect("mkdirs");
    fs::write(files.join("E7-001.dcm"), b"repaired").expect("write");

    remote
        .import_dir(&RemoteAddress::project("ProjA"), &sub, ImportPolicy::Overwrite)
        .expect("import");
    assert_eq!(remote.mutations().len(), 1);
}
