pub mod catalog;
pub mod config;
pub mod error;
pub mod fs;
pub mod location;
pub mod matcher;
pub mod orchestrator;
pub mod progress;
pub mod reconcile;
pub mod scheme;

pub use catalog::{CatalogDiff, EnsureName, FolderCatalog, FolderTree, IdentityKey, IdentitySpec};
pub use config::{AppConfig, RemoteOnlyPolicy};
pub use error::Error;
pub use fs::{FileSystem, LocalFs};
pub use location::{Granularity, Location};
pub use matcher::{MatchCombiner, MatchList, Merged, PerLevel, SchemeMatcher};
pub use orchestrator::{
    DuplicateGroup, DuplicateReport, DuplicateRequest, RenameProposal, SyncOptions,
    SyncOrchestrator, SyncRunReport,
};
pub use progress::{SilentObserver, SyncObserver};
pub use reconcile::{ReconcileOptions, ReconcileReport, SyncAction, SyncEntry, SyncReconciler, SyncSummary};
pub use scheme::{FolderScheme, GroupDict, LevelMatch, LevelPatterns};
