use crate::error::Error;
use crate::fs::normalize_path;
use crate::scheme::FolderScheme;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub local: LocalConfig,
    /// Level patterns shared by satellites that define none of their own.
    #[serde(default)]
    pub satellite_regexs: BTreeMap<String, String>,
    #[serde(default)]
    pub satellites: BTreeMap<String, SatelliteConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub rootdir: PathBuf,
    #[serde(default = "default_local_scheme")]
    pub folderscheme: FolderScheme,
    #[serde(default)]
    pub regexs: BTreeMap<String, String>,
    #[serde(default)]
    pub ignoredirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteConfig {
    pub uri: PathBuf,
    #[serde(default = "default_rootdir")]
    pub rootdir: PathBuf,
    #[serde(default = "default_satellite_scheme")]
    pub folderscheme: FolderScheme,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexs: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub ignoredirs: Vec<String>,
    #[serde(default)]
    pub file_exclude_patterns: Vec<String>,
    #[serde(default)]
    pub donotsync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountcommand: Option<Vec<String>>,
}

impl SatelliteConfig {
    /// `uri/rootdir`, lexically normalized.
    pub fn root(&self) -> PathBuf {
        normalize_path(&self.uri.join(&self.rootdir))
    }
}

/// What to do with remote folders whose identity has no local counterpart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOnlyPolicy {
    #[default]
    Ignore,
    /// Copy a remote-only subentry into its local experiment folder, when
    /// that experiment exists locally.
    CopyIntoExperiment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_tolerance")]
    pub mtime_tolerance_secs: u64,
    #[serde(default = "default_catalog_ttl")]
    pub catalog_ttl_secs: u64,
    #[serde(default)]
    pub parallel_locations: bool,
    #[serde(default)]
    pub remote_only: RemoteOnlyPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mtime_tolerance_secs: default_tolerance(),
            catalog_ttl_secs: default_catalog_ttl(),
            parallel_locations: false,
            remote_only: RemoteOnlyPolicy::Ignore,
        }
    }
}

impl SyncConfig {
    pub fn tolerance(&self) -> Duration {
        Duration::from_secs(self.mtime_tolerance_secs)
    }

    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_secs)
    }
}

fn default_local_scheme() -> FolderScheme {
    FolderScheme::parse("./year/experiment/subentry")
}

fn default_satellite_scheme() -> FolderScheme {
    FolderScheme::parse("./subentry")
}

fn default_rootdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_tolerance() -> u64 {
    10
}

fn default_catalog_ttl() -> u64 {
    60
}

impl AppConfig {
    /// Level patterns for a satellite, resolved per level: the satellite's
    /// own `regexs`, then `satellite_regexs`, then the local ones.
    pub fn satellite_patterns(&self, satellite: &SatelliteConfig) -> BTreeMap<String, String> {
        let mut patterns = self.local.regexs.clone();
        patterns.extend(self.satellite_regexs.clone());
        if let Some(own) = &satellite.regexs {
            patterns.extend(own.clone());
        }
        patterns
    }

    /// The effective configuration, rendered back as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn satellite(&self, name: &str) -> Result<&SatelliteConfig, Error> {
        self.satellites
            .get(name)
            .ok_or_else(|| Error::UnknownLocation(name.to_string()))
    }

    /// Pairs `(inner, outer)` of configured roots where `inner` lies inside
    /// `outer`. Syncing such locations walks the same files twice.
    pub fn nested_roots(&self) -> Vec<(String, String)> {
        let mut roots = vec![("local".to_string(), normalize_path(&self.local.rootdir))];
        roots.extend(
            self.satellites
                .iter()
                .map(|(name, sat)| (name.clone(), sat.root())),
        );
        nested_directories(&roots)
    }
}

/// Every pair of named directories where the first lies inside the second.
pub fn nested_directories(dirs: &[(String, PathBuf)]) -> Vec<(String, String)> {
    let mut nested = Vec::new();
    for (inner_name, inner) in dirs {
        for (outer_name, outer) in dirs {
            if inner_name != outer_name && inner != outer && inner.starts_with(outer) {
                nested.push((inner_name.clone(), outer_name.clone()));
            }
        }
    }
    nested
}

/// Load `Config.*` from the working directory (optional), overlaid with
/// `LABSYNC_*` environment variables, e.g. `LABSYNC_SYNC__MTIME_TOLERANCE_SECS`.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    build(ConfigFile::with_name("Config").required(false))
}

/// Like [`load_configuration`] but from an explicit file, which must exist.
pub fn load_from(path: &Path) -> Result<AppConfig, ConfigError> {
    build(ConfigFile::from(path).required(true))
}

fn build<S>(file: S) -> Result<AppConfig, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let settings = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix("LABSYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    settings.try_deserialize::<AppConfig>()
}
