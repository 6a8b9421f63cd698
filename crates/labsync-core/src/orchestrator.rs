use crate::catalog::{FolderCatalog, IdentityKey};
use crate::config::{AppConfig, RemoteOnlyPolicy, SyncConfig};
use crate::error::Error;
use crate::fs::base_name;
use crate::location::{Granularity, Location};
use crate::progress::SyncObserver;
use crate::reconcile::{ReconcileOptions, ReconcileReport, SyncReconciler, SyncSummary};
use ahash::AHashMap;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub verbosity: u8,
    /// Restrict the run to these identities (experiment ids, or the display
    /// form of a subentry key).
    pub only: Option<Vec<String>>,
}

#[derive(Debug)]
pub enum LocationOutcome {
    Synced,
    Failed(Error),
}

#[derive(Debug)]
pub struct LocationReport {
    pub name: String,
    pub granularity: Granularity,
    pub outcome: LocationOutcome,
    pub report: ReconcileReport,
}

impl LocationReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, LocationOutcome::Failed(_))
    }
}

#[derive(Debug, Default)]
pub struct SyncRunReport {
    pub locations: Vec<LocationReport>,
}

impl SyncRunReport {
    pub fn summary(&self) -> SyncSummary {
        let mut total = SyncSummary::default();
        for location in &self.locations {
            total += location.report.summary;
        }
        total
    }

    pub fn failed_locations(&self) -> impl Iterator<Item = &LocationReport> {
        self.locations.iter().filter(|l| l.is_failed())
    }
}

/// Which duplicate diagnostics to compute.
#[derive(Debug, Clone, Default)]
pub struct DuplicateRequest {
    pub subentries: bool,
    pub local: bool,
    /// `Some(vec![])` selects every satellite.
    pub remotes: Option<Vec<String>>,
    pub crosscheck: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatedPath {
    pub location: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub identity: IdentityKey,
    pub paths: Vec<LocatedPath>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DuplicateReport {
    pub granularity: Option<Granularity>,
    pub local: Option<Vec<DuplicateGroup>>,
    pub remotes: BTreeMap<String, Vec<DuplicateGroup>>,
    /// Identities whose folders are named differently across locations (or
    /// duplicated within one).
    pub crosscheck: Option<Vec<DuplicateGroup>>,
    /// Locations left out, with the reason.
    pub skipped: Vec<(String, String)>,
}

/// Rename `from` so its basename matches the first folder of its
/// cross-check group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameProposal {
    pub identity: IdentityKey,
    pub location: String,
    pub from: PathBuf,
    pub to: PathBuf,
}

impl DuplicateGroup {
    fn from_paths(location: &str, identity: IdentityKey, paths: Vec<PathBuf>) -> Self {
        Self {
            identity,
            paths: paths
                .into_iter()
                .map(|path| LocatedPath {
                    location: location.to_string(),
                    path,
                })
                .collect(),
        }
    }

    /// One proposal per folder whose basename differs from the first one.
    pub fn rename_proposals(&self) -> Vec<RenameProposal> {
        let Some(main) = self.paths.first() else {
            return Vec::new();
        };
        let main_name = base_name(&main.path);
        self.paths[1..]
            .iter()
            .filter(|p| base_name(&p.path) != main_name)
            .map(|p| RenameProposal {
                identity: self.identity.clone(),
                location: p.location.clone(),
                from: p.path.clone(),
                to: p
                    .path
                    .parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join(&main_name),
            })
            .collect()
    }
}

/// Drives reconciliation across every configured satellite.
pub struct SyncOrchestrator {
    local: Location,
    satellites: BTreeMap<String, Location>,
    settings: SyncConfig,
    local_catalogs: AHashMap<Granularity, FolderCatalog>,
}

impl SyncOrchestrator {
    /// Compiles every pattern and exclude glob; nothing is listed yet.
    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        for (inner, outer) in config.nested_roots() {
            warn!("Root of '{}' lies inside the root of '{}'", inner, outer);
        }
        let local = Location::local(config)?;
        let satellites = config
            .satellites
            .iter()
            .map(|(name, sat)| Location::satellite(name, sat, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(local, satellites, config.sync.clone()))
    }

    pub fn new(local: Location, satellites: Vec<Location>, settings: SyncConfig) -> Self {
        Self {
            local,
            satellites: satellites
                .into_iter()
                .map(|loc| (loc.name().to_string(), loc))
                .collect(),
            settings,
            local_catalogs: AHashMap::new(),
        }
    }

    pub fn local(&self) -> &Location {
        &self.local
    }

    pub fn satellites(&self) -> impl Iterator<Item = &Location> {
        self.satellites.values()
    }

    pub fn location(&self, name: &str) -> Result<&Location, Error> {
        if name == self.local.name() {
            return Ok(&self.local);
        }
        self.satellites
            .get(name)
            .ok_or_else(|| Error::UnknownLocation(name.to_string()))
    }

    /// Named targets are synced even when flagged `donotsync`; with no
    /// targets every other satellite is selected.
    fn select(&self, targets: &[String]) -> Result<Vec<&Location>, Error> {
        if targets.is_empty() {
            return Ok(self
                .satellites
                .values()
                .filter(|loc| {
                    if loc.donotsync() {
                        info!("[{}] donotsync is set, skipping", loc.name());
                    }
                    !loc.donotsync()
                })
                .collect());
        }
        targets
            .iter()
            .map(|name| {
                self.satellites
                    .get(name)
                    .ok_or_else(|| Error::UnknownLocation(name.clone()))
            })
            .collect()
    }

    /// The local catalog at `granularity`, rebuilt when older than the
    /// configured TTL.
    pub fn local_catalog(&mut self, granularity: Granularity) -> Result<&FolderCatalog, Error> {
        Ok(self.refresh_local(granularity)?)
    }

    fn refresh_local(&mut self, granularity: Granularity) -> Result<&mut FolderCatalog, Error> {
        let ttl = self.settings.catalog_ttl();
        match self.local_catalogs.entry(granularity) {
            Entry::Occupied(slot) => {
                let catalog = slot.into_mut();
                if catalog.rebuild_if_stale(ttl)? {
                    let diff = catalog.diff_against_previous();
                    debug!(
                        "Local {} catalog refreshed: {} added, {} removed",
                        granularity,
                        diff.added_paths.len(),
                        diff.removed_paths.len()
                    );
                }
                Ok(catalog)
            }
            Entry::Vacant(slot) => Ok(slot.insert(self.local.catalog(granularity)?)),
        }
    }

    /// Sync `targets` (all enabled satellites when empty) into the local
    /// tree.
    ///
    /// Configuration errors in any selected location abort the run before a
    /// single directory is listed. After that each location succeeds or
    /// fails on its own.
    pub fn sync_all(
        &mut self,
        targets: &[String],
        options: &SyncOptions,
        observer: &dyn SyncObserver,
    ) -> Result<SyncRunReport, Error> {
        let started = Instant::now();
        let selected = self.select(targets)?;
        self.local.validate()?;
        let mut plan = Vec::with_capacity(selected.len());
        for location in selected {
            let granularity = location.granularity()?;
            self.local.scheme().up_to(granularity.as_str())?;
            location.validate()?;
            plan.push((location.name().to_string(), granularity));
        }
        if targets.is_empty() {
            for location in self.satellites.values().filter(|loc| loc.donotsync()) {
                observer.on_location_skipped(location.name(), "donotsync");
            }
        }

        let copy_into_experiment = self.settings.remote_only == RemoteOnlyPolicy::CopyIntoExperiment;
        let mut needed: Vec<Granularity> = plan.iter().map(|(_, g)| *g).collect();
        if copy_into_experiment && needed.contains(&Granularity::Subentry) {
            needed.push(Granularity::Experiment);
        }
        needed.sort();
        needed.dedup();
        for granularity in needed {
            let catalog = self.local_catalog(granularity)?;
            info!("Local {} catalog: {} folders", granularity, catalog.len());
            for (key, path) in catalog.collisions() {
                warn!("Local {} {} is duplicated at {}", granularity, key, path.display());
            }
        }

        let reconcile = ReconcileOptions {
            dry_run: options.dry_run,
            verbosity: options.verbosity,
            tolerance: self.settings.tolerance(),
            exclude_patterns: Vec::new(),
        };
        let run = |(name, granularity): &(String, Granularity)| -> LocationReport {
            let report = match self.satellites.get(name) {
                Some(location) => self.sync_location(location, *granularity, &reconcile, options, observer),
                None => Err(Error::UnknownLocation(name.clone())),
            };
            match report {
                Ok(report) => {
                    observer.on_location_complete(name, &report.summary);
                    LocationReport {
                        name: name.clone(),
                        granularity: *granularity,
                        outcome: LocationOutcome::Synced,
                        report,
                    }
                }
                Err(err) => {
                    error!("[{}] Sync failed: {}", name, err);
                    observer.on_location_failed(name, &err);
                    LocationReport {
                        name: name.clone(),
                        granularity: *granularity,
                        outcome: LocationOutcome::Failed(err),
                        report: ReconcileReport::default(),
                    }
                }
            }
        };

        let locations: Vec<LocationReport> = if self.settings.parallel_locations {
            plan.par_iter().map(run).collect()
        } else {
            plan.iter().map(run).collect()
        };
        let report = SyncRunReport { locations };

        let summary = report.summary();
        info!(
            "Sync finished in {:.2}s: {} new folders, {} new files, {} overwritten, {} skipped, {} failed locations",
            started.elapsed().as_secs_f64(),
            summary.copied_trees,
            summary.copied_files,
            summary.overwritten,
            summary.skipped(),
            report.failed_locations().count()
        );
        Ok(report)
    }

    fn sync_location(
        &self,
        location: &Location,
        granularity: Granularity,
        base: &ReconcileOptions,
        options: &SyncOptions,
        observer: &dyn SyncObserver,
    ) -> Result<ReconcileReport, Error> {
        let name = location.name();
        observer.on_location_start(name, granularity.as_str());
        location.ensure_mounted()?;

        let local = self
            .local_catalogs
            .get(&granularity)
            .ok_or_else(|| Error::Other(format!("no local {} catalog", granularity)))?;
        let remote = location.catalog(granularity)?;
        observer.on_catalog_built(name, remote.len());
        for (key, path) in remote.collisions() {
            warn!("[{}] {} is duplicated at {}, ignoring that folder", name, key, path.display());
        }

        let reconcile = ReconcileOptions {
            exclude_patterns: location.exclude_patterns().to_vec(),
            ..base.clone()
        };
        let reconciler = SyncReconciler::new(name, &reconcile, observer);
        let only = options.only.as_deref();
        let mut report = reconciler.reconcile(&remote, local, only);

        if granularity == Granularity::Subentry
            && self.settings.remote_only == RemoteOnlyPolicy::CopyIntoExperiment
        {
            if let Some(experiments) = self.local_catalogs.get(&Granularity::Experiment) {
                self.copy_remote_only(&reconciler, &remote, local, experiments, only, &mut report);
            }
        }
        Ok(report)
    }

    /// Copy remote subentries without a local counterpart into their local
    /// experiment folder.
    fn copy_remote_only(
        &self,
        reconciler: &SyncReconciler<'_>,
        remote: &FolderCatalog,
        local: &FolderCatalog,
        experiments: &FolderCatalog,
        only: Option<&[String]>,
        report: &mut ReconcileReport,
    ) {
        let mut remote_only: Vec<(&IdentityKey, &Path)> = remote
            .iter()
            .filter(|(key, _)| local.get_by_identity(key).is_none())
            .filter(|(key, _)| {
                only.map_or(true, |ids| {
                    ids.iter().any(|id| id == key.first() || *id == key.to_string())
                })
            })
            .collect();
        remote_only.sort();

        for (key, remote_path) in remote_only {
            let expid = IdentityKey::new([key.first()]);
            match experiments.get_by_identity(&expid) {
                Some(experiment_dir) => {
                    info!(
                        "Remote-only subentry {} goes into {}",
                        key,
                        experiment_dir.display()
                    );
                    reconciler.copy_into(key, remote_path, experiment_dir, report);
                }
                None => debug!("No local experiment for remote-only subentry {}", key),
            }
        }
    }

    /// Duplicate and cross-check diagnostics. Satellites whose scheme lacks
    /// the requested level are skipped and listed in the report.
    pub fn check_duplicates(&self, request: &DuplicateRequest) -> Result<DuplicateReport, Error> {
        let granularity = if request.subentries {
            Granularity::Subentry
        } else {
            Granularity::Experiment
        };
        let mut report = DuplicateReport {
            granularity: Some(granularity),
            ..DuplicateReport::default()
        };

        let remotes: Vec<&Location> = match &request.remotes {
            Some(names) if !names.is_empty() => names
                .iter()
                .map(|name| {
                    self.satellites
                        .get(name)
                        .ok_or_else(|| Error::UnknownLocation(name.clone()))
                })
                .collect::<Result<_, _>>()?,
            _ => self.satellites.values().collect(),
        };

        if request.local || (request.remotes.is_none() && !request.crosscheck) {
            let groups = self.local.duplicates(granularity, 2)?;
            report.local = Some(
                groups
                    .into_iter()
                    .map(|(key, paths)| DuplicateGroup::from_paths(self.local.name(), key, paths))
                    .collect(),
            );
        }

        if request.remotes.is_some() {
            for location in &remotes {
                match location.duplicates(granularity, 2) {
                    Ok(groups) => {
                        let groups = groups
                            .into_iter()
                            .map(|(key, paths)| DuplicateGroup::from_paths(location.name(), key, paths))
                            .collect();
                        report.remotes.insert(location.name().to_string(), groups);
                    }
                    Err(err) if err.is_configuration() => {
                        warn!("[{}] Skipping duplicate check: {}", location.name(), err);
                        report
                            .skipped
                            .push((location.name().to_string(), err.to_string()));
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if request.crosscheck {
            report.crosscheck = Some(self.crosscheck(granularity, &remotes, &mut report.skipped)?);
        }
        Ok(report)
    }

    /// Folders per identity across the local tree and `remotes`, keeping
    /// identities with more than one folder and more than one basename.
    fn crosscheck(
        &self,
        granularity: Granularity,
        remotes: &[&Location],
        skipped: &mut Vec<(String, String)>,
    ) -> Result<Vec<DuplicateGroup>, Error> {
        let mut by_identity: BTreeMap<IdentityKey, Vec<LocatedPath>> = BTreeMap::new();
        let mut collect = |location: &Location, groups: BTreeMap<IdentityKey, Vec<PathBuf>>| {
            for (key, paths) in groups {
                by_identity.entry(key).or_default().extend(paths.into_iter().map(|path| LocatedPath {
                    location: location.name().to_string(),
                    path,
                }));
            }
        };

        collect(&self.local, self.local.duplicates(granularity, 1)?);
        for location in remotes {
            if skipped.iter().any(|(name, _)| name == location.name()) {
                continue;
            }
            match location.duplicates(granularity, 1) {
                Ok(groups) => collect(*location, groups),
                Err(err) if err.is_configuration() => {
                    warn!("[{}] Skipping cross-check: {}", location.name(), err);
                    skipped.push((location.name().to_string(), err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }

        Ok(by_identity
            .into_iter()
            .filter(|(_, paths)| {
                let mut names: Vec<String> = paths.iter().map(|p| base_name(&p.path)).collect();
                names.sort();
                names.dedup();
                paths.len() > 1 && names.len() > 1
            })
            .map(|(identity, paths)| DuplicateGroup { identity, paths })
            .collect())
    }

    /// Apply one rename proposal through the owning location's catalog.
    pub fn apply_rename(&mut self, proposal: &RenameProposal) -> Result<PathBuf, Error> {
        let new_name = base_name(&proposal.to);
        let granularity = match granularity_of(&proposal.identity) {
            Some(granularity) => granularity,
            None => self.location(&proposal.location)?.granularity()?,
        };
        if proposal.location == self.local.name() {
            return self
                .refresh_local(granularity)?
                .rename_path(&proposal.from, &new_name);
        }
        let mut catalog = self.location(&proposal.location)?.catalog(granularity)?;
        catalog.rename_path(&proposal.from, &new_name)
    }
}

fn granularity_of(key: &IdentityKey) -> Option<Granularity> {
    match key.fields().len() {
        1 => Some(Granularity::Experiment),
        2 => Some(Granularity::Subentry),
        _ => None,
    }
}
