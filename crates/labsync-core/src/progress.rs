use crate::catalog::IdentityKey;
use crate::error::Error;
use crate::reconcile::{SyncEntry, SyncSummary};
use std::path::Path;

/// Trait for reporting sync progress and transcript lines.
///
/// The CLI implements it with indicatif and colored output, tests and
/// library callers use [`SilentObserver`]. All methods default to no-ops.
pub trait SyncObserver: Send + Sync {
    fn on_location_start(&self, _location: &str, _granularity: &str) {}
    fn on_location_skipped(&self, _location: &str, _reason: &str) {}
    fn on_catalog_built(&self, _location: &str, _identities: usize) {}
    fn on_identity_start(&self, _location: &str, _key: &IdentityKey, _remote: &Path, _local: &Path) {}
    /// Only called for entries at or below the configured verbosity.
    fn on_entry(&self, _location: &str, _entry: &SyncEntry) {}
    fn on_location_complete(&self, _location: &str, _summary: &SyncSummary) {}
    fn on_location_failed(&self, _location: &str, _error: &Error) {}
}

/// No-op observer for silent operation.
pub struct SilentObserver;

impl SyncObserver for SilentObserver {}
