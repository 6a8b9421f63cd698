use crate::catalog::{FolderCatalog, FolderTree, IdentityKey, IdentitySpec};
use crate::config::{AppConfig, SatelliteConfig};
use crate::error::Error;
use crate::fs::{FileSystem, LocalFs};
use crate::reconcile::compile_excludes;
use crate::scheme::{FolderScheme, LevelPatterns};
use glob::Pattern;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Level at which a location's folders are matched against the local tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Experiment,
    Subentry,
}

impl Granularity {
    /// `subentry` when the scheme has a subentry level, else `experiment`
    /// when it has an experiment level. Anything else is unsupported.
    pub fn for_scheme(location: &str, scheme: &FolderScheme) -> Result<Self, Error> {
        if scheme.contains("subentry") {
            Ok(Granularity::Subentry)
        } else if scheme.contains("experiment") {
            Ok(Granularity::Experiment)
        } else {
            Err(Error::UnsupportedScheme {
                location: location.to_string(),
                scheme: scheme.to_string(),
            })
        }
    }

    pub fn identity(&self) -> IdentitySpec {
        match self {
            Granularity::Experiment => IdentitySpec::experiment(),
            Granularity::Subentry => IdentitySpec::subentry(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Experiment => "experiment",
            Granularity::Subentry => "subentry",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named tree: the local experiment tree or one satellite.
pub struct Location {
    name: String,
    description: Option<String>,
    tree: FolderTree,
    excludes: Vec<String>,
    exclude_patterns: Vec<Pattern>,
    donotsync: bool,
    mountable: bool,
}

impl Location {
    pub fn new(name: impl Into<String>, tree: FolderTree) -> Self {
        Self {
            name: name.into(),
            description: None,
            tree,
            excludes: Vec::new(),
            exclude_patterns: Vec::new(),
            donotsync: false,
            mountable: false,
        }
    }

    /// The local experiment tree. Patterns are compiled here so that a bad
    /// pattern surfaces before any directory is listed.
    pub fn local(config: &AppConfig) -> Result<Self, Error> {
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFs::new(&config.local.rootdir));
        let tree = FolderTree {
            fs,
            scheme: config.local.folderscheme.clone(),
            patterns: LevelPatterns::compile(&config.local.regexs)?,
            ignore_dirs: config.local.ignoredirs.clone(),
        };
        Ok(Self::new("local", tree))
    }

    pub fn satellite(name: &str, satellite: &SatelliteConfig, config: &AppConfig) -> Result<Self, Error> {
        let fs = LocalFs::new(satellite.root()).with_mount_command(satellite.mountcommand.clone());
        let tree = FolderTree {
            fs: Arc::new(fs),
            scheme: satellite.folderscheme.clone(),
            patterns: LevelPatterns::compile(&config.satellite_patterns(satellite))?,
            ignore_dirs: satellite.ignoredirs.clone(),
        };
        let location = Self::new(name, tree)
            .with_excludes(&satellite.file_exclude_patterns)?
            .with_donotsync(satellite.donotsync);
        Ok(Self {
            description: satellite.description.clone(),
            mountable: satellite.mountcommand.as_ref().is_some_and(|argv| !argv.is_empty()),
            ..location
        })
    }

    pub fn with_excludes(mut self, globs: &[String]) -> Result<Self, Error> {
        self.exclude_patterns = compile_excludes(globs)?;
        self.excludes = globs.to_vec();
        Ok(self)
    }

    pub fn with_donotsync(mut self, donotsync: bool) -> Self {
        self.donotsync = donotsync;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn tree(&self) -> &FolderTree {
        &self.tree
    }

    pub fn root(&self) -> PathBuf {
        self.tree.root()
    }

    pub fn scheme(&self) -> &FolderScheme {
        &self.tree.scheme
    }

    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    pub fn exclude_patterns(&self) -> &[Pattern] {
        &self.exclude_patterns
    }

    pub fn donotsync(&self) -> bool {
        self.donotsync
    }

    pub fn is_mounted(&self) -> bool {
        self.tree.fs.is_mounted()
    }

    pub fn granularity(&self) -> Result<Granularity, Error> {
        Granularity::for_scheme(&self.name, &self.tree.scheme)
    }

    /// Checks that every level of the scheme has a pattern.
    pub fn validate(&self) -> Result<(), Error> {
        self.tree.patterns.require(&self.tree.scheme)
    }

    /// Run the mount command once when the location looks unmounted. Only a
    /// location with a mount command can fail this check; for the others an
    /// empty root is just an empty tree.
    pub fn ensure_mounted(&self) -> Result<(), Error> {
        if self.tree.fs.is_mounted() {
            return Ok(());
        }
        if !self.mountable {
            warn!(
                "[{}] {} is empty or missing, treating it as an empty tree",
                self.name,
                self.root().display()
            );
            return Ok(());
        }
        warn!(
            "[{}] {} does not seem to be mounted, running mount command",
            self.name,
            self.root().display()
        );
        if self.tree.fs.mount()? && self.tree.fs.is_mounted() {
            info!("[{}] Mounted {}", self.name, self.root().display());
            Ok(())
        } else {
            Err(Error::NotMounted(self.name.clone()))
        }
    }

    pub fn catalog(&self, granularity: Granularity) -> Result<FolderCatalog, Error> {
        FolderCatalog::build(self.tree.clone(), granularity.identity())
    }

    /// Identities with at least `min_count` folders at `granularity`.
    pub fn duplicates(
        &self,
        granularity: Granularity,
        min_count: usize,
    ) -> Result<BTreeMap<IdentityKey, Vec<PathBuf>>, Error> {
        self.tree
            .folders_with_same_property(&granularity.identity(), min_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granularity_from_scheme() {
        let g = |s: &str| Granularity::for_scheme("x", &FolderScheme::parse(s));
        assert_eq!(g("./year/experiment/subentry").unwrap(), Granularity::Subentry);
        assert_eq!(g("./subentry").unwrap(), Granularity::Subentry);
        assert_eq!(g("./year/experiment").unwrap(), Granularity::Experiment);
        assert!(matches!(g("./year/month"), Err(Error::UnsupportedScheme { .. })));
    }

    #[test]
    fn test_identity_per_granularity() {
        assert_eq!(Granularity::Experiment.identity(), IdentitySpec::experiment());
        assert_eq!(Granularity::Subentry.identity().fields(), ["expid", "subentry_idx"]);
    }
}
