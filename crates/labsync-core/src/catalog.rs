use crate::error::Error;
use crate::fs::{base_name, normalize_path, FileSystem};
use crate::matcher::{dir_filter, SchemeMatcher};
use crate::scheme::{FolderScheme, GroupDict, LevelPatterns};
use ahash::{AHashMap, AHashSet};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Capture-group values naming one logical entity, e.g. `RS100` or
/// `(RS100, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct IdentityKey(Vec<String>);

impl IdentityKey {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    /// The outermost field, the experiment id for the standard schemes.
    pub fn first(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{}", single),
            fields => write!(f, "({})", fields.join(", ")),
        }
    }
}

/// Which scheme level a catalog stops at and which capture groups form the
/// identity of a folder at that level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySpec {
    terminal_level: String,
    fields: Vec<String>,
}

impl IdentitySpec {
    pub fn new<S: Into<String>>(terminal_level: &str, fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            terminal_level: terminal_level.to_string(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn experiment() -> Self {
        Self::new("experiment", ["expid"])
    }

    pub fn subentry() -> Self {
        Self::new("subentry", ["expid", "subentry_idx"])
    }

    pub fn terminal_level(&self) -> &str {
        &self.terminal_level
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn key_from(&self, groups: &GroupDict) -> Option<IdentityKey> {
        self.fields
            .iter()
            .map(|field| groups.get(field).cloned())
            .collect::<Option<Vec<_>>>()
            .map(IdentityKey)
    }
}

/// A directory tree together with the scheme used to read it.
#[derive(Clone)]
pub struct FolderTree {
    pub fs: Arc<dyn FileSystem>,
    pub scheme: FolderScheme,
    pub patterns: LevelPatterns,
    pub ignore_dirs: Vec<String>,
}

impl FolderTree {
    pub fn root(&self) -> PathBuf {
        self.fs.real_path(Path::new("."))
    }

    pub fn matcher(&self, terminal_level: Option<&str>) -> Result<SchemeMatcher, Error> {
        let filter = dir_filter(Arc::clone(&self.fs), &self.ignore_dirs);
        Ok(
            SchemeMatcher::new(Arc::clone(&self.fs), &self.scheme, &self.patterns, terminal_level)?
                .with_filter(filter),
        )
    }

    /// Paths grouped by the values of `group.fields()`, keeping groups with
    /// at least `min_count` paths. Walks the tree again; a 1:1 catalog
    /// cannot hold duplicates.
    pub fn folders_with_same_property(
        &self,
        group: &IdentitySpec,
        min_count: usize,
    ) -> Result<BTreeMap<IdentityKey, Vec<PathBuf>>, Error> {
        let matcher = self.matcher(Some(group.terminal_level()))?;
        let mut groups: BTreeMap<IdentityKey, Vec<PathBuf>> = BTreeMap::new();
        for (path, groupdict) in matcher.merged(&self.root()) {
            match group.key_from(&groupdict) {
                Some(key) => groups.entry(key).or_default().push(path),
                None => warn!(
                    "Match for {} lacks one of the groups {:?}, skipping",
                    path.display(),
                    group.fields()
                ),
            }
        }
        groups.retain(|_, paths| paths.len() >= min_count);
        Ok(groups)
    }
}

/// What changed between the last two builds.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CatalogDiff {
    pub added_identities: BTreeSet<IdentityKey>,
    pub added_paths: BTreeSet<PathBuf>,
    pub removed_paths: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureName {
    AlreadyNamed,
    NotCataloged,
    Renamed(PathBuf),
    Failed(String),
}

/// Bidirectional index between identity keys and folder paths for one
/// snapshot of a tree.
///
/// The indices only change through [`FolderCatalog::build`] and
/// [`FolderCatalog::rename_path`]. Changes made to the tree behind the
/// catalog's back show up on the next build.
pub struct FolderCatalog {
    tree: FolderTree,
    identity: IdentitySpec,
    path_by_identity: AHashMap<IdentityKey, PathBuf>,
    identity_by_path: AHashMap<PathBuf, IdentityKey>,
    paths: AHashSet<PathBuf>,
    previous_paths: AHashSet<PathBuf>,
    collisions: Vec<(IdentityKey, PathBuf)>,
    built_at: Option<Instant>,
}

impl FolderCatalog {
    /// Checks the configuration and walks the tree once.
    pub fn build(tree: FolderTree, identity: IdentitySpec) -> Result<Self, Error> {
        let mut catalog = Self {
            tree,
            identity,
            path_by_identity: AHashMap::new(),
            identity_by_path: AHashMap::new(),
            paths: AHashSet::new(),
            previous_paths: AHashSet::new(),
            collisions: Vec::new(),
            built_at: None,
        };
        catalog.rebuild()?;
        Ok(catalog)
    }

    pub fn rebuild(&mut self) -> Result<(), Error> {
        let started = Instant::now();
        let matcher = self.tree.matcher(Some(self.identity.terminal_level()))?;

        let mut path_by_identity: AHashMap<IdentityKey, PathBuf> = AHashMap::new();
        let mut identity_by_path = AHashMap::new();
        let mut collisions = Vec::new();

        for (path, groups) in matcher.merged(&self.tree.root()) {
            let Some(key) = self.identity.key_from(&groups) else {
                warn!(
                    "Match for {} lacks one of the groups {:?}, skipping",
                    path.display(),
                    self.identity.fields()
                );
                continue;
            };
            match path_by_identity.entry(key) {
                Entry::Occupied(existing) => {
                    warn!(
                        "Identity {} is already cataloged at {}, ignoring {}",
                        existing.key(),
                        existing.get().display(),
                        path.display()
                    );
                    collisions.push((existing.key().clone(), path));
                }
                Entry::Vacant(slot) => {
                    identity_by_path.insert(path.clone(), slot.key().clone());
                    slot.insert(path);
                }
            }
        }

        self.previous_paths = std::mem::take(&mut self.paths);
        self.paths = identity_by_path.keys().cloned().collect();
        self.path_by_identity = path_by_identity;
        self.identity_by_path = identity_by_path;
        self.collisions = collisions;
        self.built_at = Some(Instant::now());
        debug!(
            "Cataloged {} {} folders under {} in {:.2}s",
            self.path_by_identity.len(),
            self.identity.terminal_level(),
            self.tree.root().display(),
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Rebuild when the last build is older than `ttl`. Returns whether a
    /// rebuild happened.
    pub fn rebuild_if_stale(&mut self, ttl: Duration) -> Result<bool, Error> {
        if self.is_fresh(ttl) {
            return Ok(false);
        }
        self.rebuild()?;
        Ok(true)
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.built_at.is_some_and(|at| at.elapsed() < ttl)
    }

    pub fn built_at(&self) -> Option<Instant> {
        self.built_at
    }

    /// Set difference between the path sets of the last two builds. Does not
    /// touch the filesystem.
    pub fn diff_against_previous(&self) -> CatalogDiff {
        let added_paths: BTreeSet<PathBuf> =
            self.paths.difference(&self.previous_paths).cloned().collect();
        let removed_paths = self.previous_paths.difference(&self.paths).cloned().collect();
        let added_identities = added_paths
            .iter()
            .filter_map(|path| self.identity_by_path.get(path).cloned())
            .collect();
        CatalogDiff {
            added_identities,
            added_paths,
            removed_paths,
        }
    }

    pub fn get_by_identity(&self, key: &IdentityKey) -> Option<&Path> {
        self.path_by_identity.get(key).map(PathBuf::as_path)
    }

    pub fn identity_of(&self, path: &Path) -> Option<&IdentityKey> {
        self.identity_by_path.get(path)
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.path_by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path_by_identity.is_empty()
    }

    pub fn identities(&self) -> impl Iterator<Item = &IdentityKey> {
        self.path_by_identity.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, &Path)> {
        self.path_by_identity
            .iter()
            .map(|(key, path)| (key, path.as_path()))
    }

    /// Identities whose paths were dropped during the last build because an
    /// earlier path already claimed them.
    pub fn collisions(&self) -> &[(IdentityKey, PathBuf)] {
        &self.collisions
    }

    pub fn identity_spec(&self) -> &IdentitySpec {
        &self.identity
    }

    pub fn tree(&self) -> &FolderTree {
        &self.tree
    }

    /// `first field -> remaining fields -> path`, e.g.
    /// `expid -> subentry_idx -> path`.
    pub fn nested(&self) -> BTreeMap<String, BTreeMap<String, PathBuf>> {
        let mut nested: BTreeMap<String, BTreeMap<String, PathBuf>> = BTreeMap::new();
        for (key, path) in &self.path_by_identity {
            let rest = key.fields().get(1..).unwrap_or_default().join("/");
            nested
                .entry(key.first().to_string())
                .or_default()
                .insert(rest, path.clone());
        }
        nested
    }

    pub fn duplicates(
        &self,
        group: &IdentitySpec,
        min_count: usize,
    ) -> Result<BTreeMap<IdentityKey, Vec<PathBuf>>, Error> {
        self.tree.folders_with_same_property(group, min_count)
    }

    /// Rename a cataloged folder within its parent directory and update both
    /// indices for that one entry. Folders shadowed by a collision can be
    /// renamed too. On any failure the catalog is unchanged.
    pub fn rename_path(&mut self, old_path: &Path, new_name: &str) -> Result<PathBuf, Error> {
        let old_path = normalize_path(old_path);
        let parent = old_path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        let requested = Path::new(new_name);

        let outside = || Error::RenameOutsideParent {
            from: old_path.clone(),
            to: new_name.to_string(),
        };
        if let Some(new_parent) = requested.parent().filter(|p| !p.as_os_str().is_empty()) {
            if normalize_path(new_parent) != parent {
                warn!(
                    "Parent of '{}' does not match parent of {}, aborting rename",
                    new_name,
                    old_path.display()
                );
                return Err(outside());
            }
        }
        let new_base = base_name(requested);
        if new_base.is_empty() || new_base == ".." {
            return Err(outside());
        }

        let collision = self.collisions.iter().position(|(_, path)| *path == old_path);
        let key = match self.identity_by_path.get(&old_path) {
            Some(key) => key.clone(),
            None => match collision {
                Some(idx) => self.collisions[idx].0.clone(),
                None => return Err(Error::NotInCatalog(old_path)),
            },
        };

        if base_name(&old_path) == new_base {
            warn!("{} is already named '{}'", old_path.display(), new_base);
            return Ok(old_path);
        }

        let new_path = parent.join(&new_base);
        if matches!(self.tree.fs.is_dir(&new_path), Ok(true)) {
            return Err(Error::Rename {
                from: old_path,
                to: new_path,
                source: io::Error::new(io::ErrorKind::AlreadyExists, "target folder exists"),
            });
        }
        if let Err(source) = self.tree.fs.rename(&old_path, &new_path) {
            return Err(Error::Rename {
                from: old_path,
                to: new_path,
                source,
            });
        }

        info!("Renamed {} to {}", old_path.display(), new_path.display());
        if !self.identity_by_path.contains_key(&old_path) {
            // A shadowed duplicate: only its collision record moves.
            if let Some(idx) = collision {
                self.collisions[idx].1 = new_path.clone();
            }
            return Ok(new_path);
        }
        self.identity_by_path.remove(&old_path);
        self.identity_by_path.insert(new_path.clone(), key.clone());
        self.path_by_identity.insert(key, new_path.clone());
        self.paths.remove(&old_path);
        self.paths.insert(new_path.clone());
        Ok(new_path)
    }

    /// Make sure the folder of `key` is named `desired_name`.
    pub fn ensure_name(&mut self, key: &IdentityKey, desired_name: &str) -> EnsureName {
        let desired = base_name(Path::new(desired_name));
        let Some(current) = self.path_by_identity.get(key).cloned() else {
            warn!("{} is not present in {}", key, self.tree.root().display());
            return EnsureName::NotCataloged;
        };
        if base_name(&current) == desired {
            debug!("{} is already named '{}'", current.display(), desired);
            return EnsureName::AlreadyNamed;
        }
        match self.rename_path(&current, &desired) {
            Ok(new_path) => EnsureName::Renamed(new_path),
            Err(err) => {
                warn!("Could not rename {}: {}", current.display(), err);
                EnsureName::Failed(err.to_string())
            }
        }
    }
}
