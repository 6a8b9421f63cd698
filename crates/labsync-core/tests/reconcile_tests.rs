use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filetime::{set_file_mtime, FileTime};
use tempfile::tempdir;

use labsync_core::{
    FileSystem, FolderCatalog, FolderScheme, FolderTree, IdentitySpec, LevelPatterns, LocalFs,
    ReconcileOptions, SilentObserver, SyncAction, SyncEntry, SyncObserver, SyncReconciler,
};

fn patterns() -> LevelPatterns {
    let mut sources = BTreeMap::new();
    sources.insert("year".to_string(), r"(?P<year>[0-9]{4})".to_string());
    sources.insert(
        "experiment".to_string(),
        r"(?P<expid>RS[0-9]{3})[_ ]+(?P<exp_titledesc>.+)".to_string(),
    );
    sources.insert(
        "subentry".to_string(),
        r"(?P<expid>RS[0-9]{3})-?(?P<subentry_idx>[^_ ])[_ ]+(?P<subentry_titledesc>.+)".to_string(),
    );
    LevelPatterns::compile(&sources).unwrap()
}

fn catalog(root: &Path) -> FolderCatalog {
    let fs: Arc<dyn FileSystem> = Arc::new(LocalFs::new(root));
    let tree = FolderTree {
        fs,
        scheme: FolderScheme::parse("./year/experiment/subentry"),
        patterns: patterns(),
        ignore_dirs: Vec::new(),
    };
    FolderCatalog::build(tree, IdentitySpec::subentry()).unwrap()
}

const SUBENTRY: &str = "2024/RS100 Title/RS100a Sub";

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn set_mtime(path: &Path, secs: i64) {
    set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
}

fn mtime(path: &Path) -> i64 {
    FileTime::from_last_modification_time(&fs::metadata(path).unwrap()).unix_seconds()
}

struct Setup {
    _remote_dir: tempfile::TempDir,
    _local_dir: tempfile::TempDir,
    remote: PathBuf,
    local: PathBuf,
}

/// Local and remote trees that both contain `SUBENTRY` with `old.txt` at
/// the same mtime.
fn setup() -> Setup {
    let remote_dir = tempdir().unwrap();
    let local_dir = tempdir().unwrap();
    let remote = remote_dir.path().to_path_buf();
    let local = local_dir.path().to_path_buf();

    for root in [&remote, &local] {
        let file = root.join(SUBENTRY).join("old.txt");
        write(&file, "old");
        set_mtime(&file, 1_700_000_000);
    }
    Setup {
        _remote_dir: remote_dir,
        _local_dir: local_dir,
        remote,
        local,
    }
}

fn run(setup: &Setup, options: &ReconcileOptions) -> labsync_core::ReconcileReport {
    let remote = catalog(&setup.remote);
    let local = catalog(&setup.local);
    SyncReconciler::new("remote", options, &SilentObserver).reconcile(&remote, &local, None)
}

fn actions(report: &labsync_core::ReconcileReport) -> Vec<(SyncAction, String)> {
    report
        .entries
        .iter()
        .map(|e| {
            let name = e.source.file_name().unwrap().to_string_lossy().into_owned();
            (e.action.clone(), name)
        })
        .collect()
}

#[test]
fn test_new_file_is_copied_into_existing_subentry() {
    let setup = setup();
    write(&setup.remote.join(SUBENTRY).join("new.txt"), "new data");

    let report = run(&setup, &ReconcileOptions::default());

    let copied = setup.local.join(SUBENTRY).join("new.txt");
    assert_eq!(fs::read_to_string(&copied).unwrap(), "new data");
    assert_eq!(mtime(&copied), mtime(&setup.remote.join(SUBENTRY).join("new.txt")));

    let changes: Vec<&SyncEntry> = report.changes().collect();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].action, SyncAction::CopyFile);
    assert_eq!(changes[0].action.symbol(), "N");
    assert_eq!(changes[0].destination, copied);
    assert_eq!(report.summary.current, 1);
    assert_eq!(report.identities.len(), 1);
}

#[test]
fn test_remote_only_identity_is_left_alone() {
    let setup = setup();
    write(&setup.remote.join("2024/RS100 Title/RS100b Other/data.csv"), "x");

    let report = run(&setup, &ReconcileOptions::default());

    assert!(!setup.local.join("2024/RS100 Title/RS100b Other").exists());
    assert!(report.entries.iter().all(|e| !e.source.starts_with(setup.remote.join("2024/RS100 Title/RS100b Other"))));
    assert_eq!(report.identities.len(), 1);
}

#[test]
fn test_second_run_is_a_no_op() {
    let setup = setup();
    write(&setup.remote.join(SUBENTRY).join("new.txt"), "new");
    write(&setup.remote.join(SUBENTRY).join("raw/scan1.tif"), "scan1");
    write(&setup.remote.join(SUBENTRY).join("raw/deeper/scan2.tif"), "scan2");

    let first = run(&setup, &ReconcileOptions::default());
    assert_eq!(first.summary.copied_trees, 1);
    assert_eq!(first.summary.copied_files, 1);
    assert_eq!(
        fs::read_to_string(setup.local.join(SUBENTRY).join("raw/deeper/scan2.tif")).unwrap(),
        "scan2"
    );

    let second = run(&setup, &ReconcileOptions::default());
    assert_eq!(second.changes().count(), 0);
    assert_eq!(second.summary.current, 4);
}

#[test]
fn test_overwrite_only_beyond_tolerance() {
    let setup = setup();
    let src = setup.remote.join(SUBENTRY).join("old.txt");
    let dst = setup.local.join(SUBENTRY).join("old.txt");
    fs::write(&src, "remote version").unwrap();
    let t = 1_700_000_000;

    // Local newer than remote.
    set_mtime(&src, t);
    set_mtime(&dst, t + 5);
    let report = run(&setup, &ReconcileOptions::default());
    assert_eq!(report.summary.current, 1);
    assert_eq!(fs::read_to_string(&dst).unwrap(), "old");

    // Local older, but within the window.
    set_mtime(&dst, t - 10);
    let report = run(&setup, &ReconcileOptions::default());
    assert_eq!(report.summary.overwritten, 0);
    assert_eq!(fs::read_to_string(&dst).unwrap(), "old");

    // Local older than the window.
    set_mtime(&dst, t - 11);
    let report = run(&setup, &ReconcileOptions::default());
    assert_eq!(report.summary.overwritten, 1);
    assert_eq!(report.entries[0].action.symbol(), "O");
    assert_eq!(fs::read_to_string(&dst).unwrap(), "remote version");
    assert_eq!(mtime(&dst), t);
}

#[test]
fn test_custom_tolerance() {
    let setup = setup();
    let src = setup.remote.join(SUBENTRY).join("old.txt");
    let dst = setup.local.join(SUBENTRY).join("old.txt");
    set_mtime(&src, 1_700_000_000);
    set_mtime(&dst, 1_700_000_000 - 2);

    let strict = ReconcileOptions {
        tolerance: Duration::ZERO,
        ..ReconcileOptions::default()
    };
    let report = run(&setup, &strict);
    assert_eq!(report.summary.overwritten, 1);
}

#[test]
fn test_dry_run_changes_nothing() {
    let setup = setup();
    write(&setup.remote.join(SUBENTRY).join("new.txt"), "new");
    write(&setup.remote.join(SUBENTRY).join("raw/scan1.tif"), "scan1");
    let src = setup.remote.join(SUBENTRY).join("old.txt");
    fs::write(&src, "updated").unwrap();
    set_mtime(&src, 1_800_000_000);

    let dry = ReconcileOptions {
        dry_run: true,
        ..ReconcileOptions::default()
    };
    let preview = run(&setup, &dry);

    assert!(!setup.local.join(SUBENTRY).join("new.txt").exists());
    assert!(!setup.local.join(SUBENTRY).join("raw").exists());
    assert_eq!(fs::read_to_string(setup.local.join(SUBENTRY).join("old.txt")).unwrap(), "old");

    let real = run(&setup, &ReconcileOptions::default());
    assert_eq!(actions(&preview), actions(&real));
    assert_eq!(preview.summary, real.summary);
}

#[test]
fn test_excluded_files_are_never_copied() {
    let setup = setup();
    write(&setup.remote.join(SUBENTRY).join("scratch.tmp"), "x");
    write(&setup.remote.join(SUBENTRY).join("raw/cache.tmp"), "x");
    write(&setup.remote.join(SUBENTRY).join("raw/keep.dat"), "x");

    let options = ReconcileOptions::default()
        .with_excludes(&["*.tmp".to_string()])
        .unwrap();
    let report = run(&setup, &options);

    assert!(!setup.local.join(SUBENTRY).join("scratch.tmp").exists());
    assert!(!setup.local.join(SUBENTRY).join("raw/cache.tmp").exists());
    assert!(setup.local.join(SUBENTRY).join("raw/keep.dat").exists());
    assert_eq!(report.summary.excluded, 2);
}

#[test]
fn test_type_conflicts_are_reported_and_skipped() {
    let setup = setup();
    // Remote file where the local side has a folder, and the reverse.
    write(&setup.remote.join(SUBENTRY).join("data"), "a file");
    fs::create_dir_all(setup.local.join(SUBENTRY).join("data")).unwrap();
    write(&setup.remote.join(SUBENTRY).join("raw/scan.tif"), "scan");
    write(&setup.local.join(SUBENTRY).join("raw"), "a file");
    write(&setup.remote.join(SUBENTRY).join("zz_after.txt"), "after");

    let report = run(&setup, &ReconcileOptions::default());

    let unexpected: Vec<&SyncEntry> = report
        .entries
        .iter()
        .filter(|e| matches!(e.action, SyncAction::Unexpected(_)))
        .collect();
    assert_eq!(unexpected.len(), 2);
    assert!(unexpected.iter().all(|e| e.action.symbol() == "S!"));
    assert!(setup.local.join(SUBENTRY).join("data").is_dir());
    assert_eq!(fs::read_to_string(setup.local.join(SUBENTRY).join("raw")).unwrap(), "a file");

    // The rest of the subentry is still synced.
    assert!(setup.local.join(SUBENTRY).join("zz_after.txt").exists());
}

#[test]
fn test_only_filter_limits_identities() {
    let setup = setup();
    for root in [&setup.remote, &setup.local] {
        fs::create_dir_all(root.join("2024/RS101 Second/RS101a Alone")).unwrap();
    }
    write(&setup.remote.join(SUBENTRY).join("new.txt"), "new");
    write(&setup.remote.join("2024/RS101 Second/RS101a Alone/new.txt"), "new");

    let remote = catalog(&setup.remote);
    let local = catalog(&setup.local);
    let options = ReconcileOptions::default();
    let reconciler = SyncReconciler::new("remote", &options, &SilentObserver);
    let only = vec!["RS101".to_string()];
    let report = reconciler.reconcile(&remote, &local, Some(&only));

    assert!(setup.local.join("2024/RS101 Second/RS101a Alone/new.txt").exists());
    assert!(!setup.local.join(SUBENTRY).join("new.txt").exists());
    assert_eq!(report.identities.len(), 1);
}

#[derive(Default)]
struct Recorder {
    lines: Mutex<Vec<String>>,
}

impl SyncObserver for Recorder {
    fn on_entry(&self, _location: &str, entry: &SyncEntry) {
        let name = entry.source.file_name().unwrap().to_string_lossy().into_owned();
        self.lines
            .lock()
            .unwrap()
            .push(format!("{} {}", entry.action.symbol(), name));
    }
}

#[test]
fn test_observer_sees_entries_by_verbosity() {
    let setup = setup();
    write(&setup.remote.join(SUBENTRY).join("new.txt"), "new");
    let remote = catalog(&setup.remote);
    let local = catalog(&setup.local);

    let quiet = Recorder::default();
    let options = ReconcileOptions {
        dry_run: true,
        verbosity: 1,
        ..ReconcileOptions::default()
    };
    SyncReconciler::new("remote", &options, &quiet).reconcile(&remote, &local, None);
    assert_eq!(*quiet.lines.lock().unwrap(), vec!["N new.txt"]);

    let chatty = Recorder::default();
    let options = ReconcileOptions {
        dry_run: true,
        verbosity: 2,
        ..ReconcileOptions::default()
    };
    SyncReconciler::new("remote", &options, &chatty).reconcile(&remote, &local, None);
    let mut lines = chatty.lines.lock().unwrap().clone();
    lines.sort();
    assert_eq!(lines, vec!["N new.txt", "S old.txt"]);
}
