use crate::catalog::{FolderCatalog, IdentityKey};
use crate::error::Error;
use crate::progress::SyncObserver;
use filetime::FileTime;
use glob::Pattern;
use std::collections::BTreeSet;
use std::fs::{self, Metadata};
use std::io;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_MTIME_TOLERANCE: Duration = Duration::from_secs(10);

/// What happened (or, in a dry run, would happen) to one remote entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    CopyTree,
    CopyFile,
    Overwrite,
    /// Local copy is at least as recent as the remote one.
    Current,
    Excluded,
    /// Source or destination is not what it should be, e.g. a folder where a
    /// file was expected.
    Unexpected(String),
    Failed(String),
}

impl SyncAction {
    pub fn symbol(&self) -> &'static str {
        match self {
            SyncAction::CopyTree | SyncAction::CopyFile => "N",
            SyncAction::Overwrite => "O",
            SyncAction::Current | SyncAction::Excluded => "S",
            SyncAction::Unexpected(_) | SyncAction::Failed(_) => "S!",
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            SyncAction::CopyTree => "copytree",
            SyncAction::CopyFile | SyncAction::Overwrite => "copy",
            SyncAction::Current | SyncAction::Unexpected(_) => "skipping",
            SyncAction::Excluded => "excluding",
            SyncAction::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SyncAction::Unexpected(reason) | SyncAction::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Lowest verbosity at which the entry is shown in a transcript.
    pub fn verbosity(&self) -> u8 {
        match self {
            SyncAction::Current | SyncAction::Excluded => 2,
            _ => 1,
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(
            self,
            SyncAction::CopyTree | SyncAction::CopyFile | SyncAction::Overwrite
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    pub identity: Option<IdentityKey>,
    pub action: SyncAction,
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub copied_trees: usize,
    pub copied_files: usize,
    pub overwritten: usize,
    pub current: usize,
    pub excluded: usize,
    pub unexpected: usize,
    pub failed: usize,
}

impl SyncSummary {
    fn add(&mut self, action: &SyncAction) {
        match action {
            SyncAction::CopyTree => self.copied_trees += 1,
            SyncAction::CopyFile => self.copied_files += 1,
            SyncAction::Overwrite => self.overwritten += 1,
            SyncAction::Current => self.current += 1,
            SyncAction::Excluded => self.excluded += 1,
            SyncAction::Unexpected(_) => self.unexpected += 1,
            SyncAction::Failed(_) => self.failed += 1,
        }
    }

    pub fn changes(&self) -> usize {
        self.copied_trees + self.copied_files + self.overwritten
    }

    pub fn skipped(&self) -> usize {
        self.current + self.excluded + self.unexpected + self.failed
    }
}

impl AddAssign for SyncSummary {
    fn add_assign(&mut self, other: Self) {
        self.copied_trees += other.copied_trees;
        self.copied_files += other.copied_files;
        self.overwritten += other.overwritten;
        self.current += other.current;
        self.excluded += other.excluded;
        self.unexpected += other.unexpected;
        self.failed += other.failed;
    }
}

/// Every entry of one reconciliation pass, in processing order.
#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub identities: Vec<IdentityKey>,
    pub entries: Vec<SyncEntry>,
    pub summary: SyncSummary,
    current: Option<IdentityKey>,
}

impl ReconcileReport {
    pub(crate) fn begin_identity(&mut self, key: &IdentityKey) {
        self.identities.push(key.clone());
        self.current = Some(key.clone());
    }

    pub(crate) fn end_identity(&mut self) {
        self.current = None;
    }

    pub fn changes(&self) -> impl Iterator<Item = &SyncEntry> {
        self.entries.iter().filter(|e| e.action.is_change())
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub dry_run: bool,
    pub verbosity: u8,
    pub tolerance: Duration,
    pub exclude_patterns: Vec<Pattern>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            verbosity: 0,
            tolerance: DEFAULT_MTIME_TOLERANCE,
            exclude_patterns: Vec::new(),
        }
    }
}

impl ReconcileOptions {
    pub fn with_excludes(mut self, globs: &[String]) -> Result<Self, Error> {
        self.exclude_patterns = compile_excludes(globs)?;
        Ok(self)
    }

    pub fn is_excluded(&self, file_name: &str) -> bool {
        self.exclude_patterns.iter().any(|p| p.matches(file_name))
    }
}

pub fn compile_excludes(globs: &[String]) -> Result<Vec<Pattern>, Error> {
    globs
        .iter()
        .map(|glob| {
            Pattern::new(glob).map_err(|source| Error::InvalidGlob {
                pattern: glob.clone(),
                source,
            })
        })
        .collect()
}

/// `true` when `source` is newer than `destination` by more than
/// `tolerance`.
pub fn is_newer(source: SystemTime, destination: SystemTime, tolerance: Duration) -> bool {
    destination
        .checked_add(tolerance)
        .map_or(false, |limit| source > limit)
}

/// One-way copy from a satellite tree into the local tree.
///
/// Every file and folder is handled on its own: an error is recorded in the
/// report and the pass carries on with the next entry.
pub struct SyncReconciler<'a> {
    location: &'a str,
    options: &'a ReconcileOptions,
    observer: &'a dyn SyncObserver,
}

impl<'a> SyncReconciler<'a> {
    pub fn new(location: &'a str, options: &'a ReconcileOptions, observer: &'a dyn SyncObserver) -> Self {
        Self {
            location,
            options,
            observer,
        }
    }

    /// Identities present in both catalogs, optionally narrowed to the ones
    /// whose first field (or full display form) is in `only`.
    pub fn common_identities(
        remote: &FolderCatalog,
        local: &FolderCatalog,
        only: Option<&[String]>,
    ) -> BTreeSet<IdentityKey> {
        remote
            .identities()
            .filter(|key| local.get_by_identity(key).is_some())
            .filter(|key| is_allowed(key, only))
            .cloned()
            .collect()
    }

    /// Sync the folder of every common identity into its local counterpart.
    /// Identities found on one side only are left alone.
    pub fn reconcile(
        &self,
        remote: &FolderCatalog,
        local: &FolderCatalog,
        only: Option<&[String]>,
    ) -> ReconcileReport {
        let common = Self::common_identities(remote, local, only);
        info!(
            "[{}] {} common identities ({} remote, {} local)",
            self.location,
            common.len(),
            remote.len(),
            local.len()
        );

        let mut report = ReconcileReport::default();
        for key in &common {
            let (Some(remote_path), Some(local_path)) =
                (remote.get_by_identity(key), local.get_by_identity(key))
            else {
                continue;
            };
            info!(
                "[{}] Syncing {}: {} -> {}",
                self.location,
                key,
                remote_path.display(),
                local_path.display()
            );
            self.observer
                .on_identity_start(self.location, key, remote_path, local_path);
            report.begin_identity(key);
            self.sync_contents(remote_path, local_path, &mut report);
            report.end_identity();
        }
        report
    }

    /// Copy `remote_dir` into `local_parent` under the same name within the
    /// scope of `key`, used for remote folders without a local counterpart.
    pub fn copy_into(&self, key: &IdentityKey, remote_dir: &Path, local_parent: &Path, report: &mut ReconcileReport) {
        self.observer
            .on_identity_start(self.location, key, remote_dir, local_parent);
        report.begin_identity(key);
        self.sync_folder(remote_dir, local_parent, report);
        report.end_identity();
    }

    /// Merge the children of `remote_dir` into `local_dir`.
    pub fn sync_contents(&self, remote_dir: &Path, local_dir: &Path, report: &mut ReconcileReport) {
        if !local_dir.is_dir() {
            self.record(
                report,
                SyncAction::Unexpected("destination is not a directory".into()),
                remote_dir,
                local_dir,
            );
            return;
        }
        let entries = match fs::read_dir(remote_dir) {
            Ok(entries) => entries,
            Err(err) => {
                self.record(report, SyncAction::Failed(err.to_string()), remote_dir, local_dir);
                return;
            }
        };
        for entry in entries {
            match entry {
                Ok(entry) => self.sync_entry(&entry.path(), local_dir, report),
                Err(err) => {
                    self.record(report, SyncAction::Failed(err.to_string()), remote_dir, local_dir)
                }
            }
        }
    }

    fn sync_entry(&self, remote: &Path, local_dir: &Path, report: &mut ReconcileReport) {
        match fs::metadata(remote) {
            Ok(meta) if meta.is_dir() => self.sync_folder(remote, local_dir, report),
            Ok(_) => self.sync_file(remote, local_dir, report),
            Err(err) => self.record(report, SyncAction::Failed(err.to_string()), remote, local_dir),
        }
    }

    /// Sync `remote_dir` into `local_parent/<name of remote_dir>`: copied
    /// whole when missing, merged child by child otherwise.
    pub fn sync_folder(&self, remote_dir: &Path, local_parent: &Path, report: &mut ReconcileReport) {
        if !local_parent.is_dir() {
            self.record(
                report,
                SyncAction::Unexpected("destination is not a directory".into()),
                remote_dir,
                local_parent,
            );
            return;
        }
        let Some(name) = remote_dir.file_name() else {
            self.record(
                report,
                SyncAction::Unexpected("source has no folder name".into()),
                remote_dir,
                local_parent,
            );
            return;
        };
        let destination = local_parent.join(name);

        match fs::metadata(&destination) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.record(report, SyncAction::CopyTree, remote_dir, &destination);
                if !self.options.dry_run {
                    self.copy_tree(remote_dir, &destination, report);
                }
            }
            Ok(meta) if meta.is_dir() => self.sync_contents(remote_dir, &destination, report),
            Ok(_) => self.record(
                report,
                SyncAction::Unexpected("destination is a file".into()),
                remote_dir,
                &destination,
            ),
            Err(err) => self.record(report, SyncAction::Failed(err.to_string()), remote_dir, &destination),
        }
    }

    /// Sync one file into `local_dir`.
    pub fn sync_file(&self, remote_file: &Path, local_dir: &Path, report: &mut ReconcileReport) {
        if !local_dir.is_dir() {
            self.record(
                report,
                SyncAction::Unexpected("destination is not a directory".into()),
                remote_file,
                local_dir,
            );
            return;
        }
        let source_meta = match fs::metadata(remote_file) {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                self.record(
                    report,
                    SyncAction::Unexpected("source is not a file".into()),
                    remote_file,
                    local_dir,
                );
                return;
            }
        };
        let file_name = remote_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let destination = local_dir.join(&file_name);
        if self.options.is_excluded(&file_name) {
            self.record(report, SyncAction::Excluded, remote_file, &destination);
            return;
        }

        let dest_meta = match fs::metadata(&destination) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.copy_and_record(SyncAction::CopyFile, remote_file, &destination, &source_meta, report);
                return;
            }
            Err(err) => {
                self.record(report, SyncAction::Failed(err.to_string()), remote_file, &destination);
                return;
            }
        };
        if dest_meta.is_dir() {
            self.record(
                report,
                SyncAction::Unexpected("destination is a directory".into()),
                remote_file,
                &destination,
            );
            return;
        }
        if !dest_meta.is_file() {
            self.record(
                report,
                SyncAction::Unexpected("destination is not a file".into()),
                remote_file,
                &destination,
            );
            return;
        }

        match (source_meta.modified(), dest_meta.modified()) {
            (Ok(src), Ok(dst)) if is_newer(src, dst, self.options.tolerance) => {
                self.copy_and_record(SyncAction::Overwrite, remote_file, &destination, &source_meta, report);
            }
            (Ok(_), Ok(_)) => self.record(report, SyncAction::Current, remote_file, &destination),
            (Err(err), _) | (_, Err(err)) => {
                self.record(report, SyncAction::Failed(err.to_string()), remote_file, &destination)
            }
        }
    }

    fn copy_and_record(
        &self,
        action: SyncAction,
        source: &Path,
        destination: &Path,
        source_meta: &Metadata,
        report: &mut ReconcileReport,
    ) {
        if self.options.dry_run {
            self.record(report, action, source, destination);
            return;
        }
        match copy_file(source, destination, source_meta) {
            Ok(()) => self.record(report, action, source, destination),
            Err(err) => self.record(report, SyncAction::Failed(err.to_string()), source, destination),
        }
    }

    /// Recursive copy of a folder that does not exist locally yet. Excluded
    /// files are left out; failures are recorded per entry.
    fn copy_tree(&self, source: &Path, destination: &Path, report: &mut ReconcileReport) {
        let mut dirs: Vec<(PathBuf, Metadata)> = Vec::new();
        for entry in WalkDir::new(source).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(source).to_path_buf();
                    self.record(report, SyncAction::Failed(err.to_string()), &path, destination);
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };
            let target = destination.join(relative);
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    self.record(report, SyncAction::Failed(err.to_string()), entry.path(), &target);
                    continue;
                }
            };

            if meta.is_dir() {
                match fs::create_dir_all(&target) {
                    Ok(()) => dirs.push((target, meta)),
                    Err(err) => {
                        self.record(report, SyncAction::Failed(err.to_string()), entry.path(), &target)
                    }
                }
            } else if self
                .options
                .is_excluded(&entry.file_name().to_string_lossy())
            {
                self.record(report, SyncAction::Excluded, entry.path(), &target);
            } else if let Err(err) = copy_file(entry.path(), &target, &meta) {
                self.record(report, SyncAction::Failed(err.to_string()), entry.path(), &target);
            }
        }

        // Writing into a directory bumps its mtime, so stamp them last.
        for (dir, meta) in dirs.iter().rev() {
            if let Err(err) = set_times(dir, meta) {
                debug!("Cannot set times on {}: {}", dir.display(), err);
            }
        }
    }

    fn record(&self, report: &mut ReconcileReport, action: SyncAction, source: &Path, destination: &Path) {
        match &action {
            SyncAction::Failed(reason) => error!(
                "[{}] {} -> {}: {}",
                self.location,
                source.display(),
                destination.display(),
                reason
            ),
            SyncAction::Unexpected(reason) => warn!(
                "[{}] Skipping {}: {}",
                self.location,
                source.display(),
                reason
            ),
            action if action.is_change() => info!(
                "[{}] {} {} -> {}",
                self.location,
                action.verb(),
                source.display(),
                destination.display()
            ),
            _ => debug!(
                "[{}] {} {}",
                self.location,
                action.verb(),
                source.display()
            ),
        }

        let entry = SyncEntry {
            identity: report.current.clone(),
            action,
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        };
        if entry.action.verbosity() <= self.options.verbosity {
            self.observer.on_entry(self.location, &entry);
        }
        report.summary.add(&entry.action);
        report.entries.push(entry);
    }
}

fn is_allowed(key: &IdentityKey, only: Option<&[String]>) -> bool {
    match only {
        None => true,
        Some(allowed) => allowed
            .iter()
            .any(|id| id == key.first() || *id == key.to_string()),
    }
}

/// Copy a file and carry over its access and modification times.
pub fn copy_file(source: &Path, destination: &Path, source_meta: &Metadata) -> io::Result<()> {
    fs::copy(source, destination)?;
    set_times(destination, source_meta)
}

fn set_times(path: &Path, meta: &Metadata) -> io::Result<()> {
    filetime::set_file_times(
        path,
        FileTime::from_last_access_time(meta),
        FileTime::from_last_modification_time(meta),
    )
}
