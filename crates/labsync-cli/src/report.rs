use anyhow::{Context, Result};
use labsync_core::orchestrator::LocationOutcome;
use labsync_core::SyncRunReport;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    location: &'a str,
    identity: String,
    symbol: &'static str,
    action: &'static str,
    source: String,
    destination: String,
    reason: String,
}

/// One row per transcript entry, regardless of verbosity, plus one row per
/// failed location. Returns the number of rows written.
pub fn write_csv(path: &Path, run: &SyncRunReport) -> Result<usize> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("cannot create report {}", path.display()))?;
    let mut rows = 0;

    for location in &run.locations {
        if let LocationOutcome::Failed(err) = &location.outcome {
            writer.serialize(ReportRow {
                location: &location.name,
                identity: String::new(),
                symbol: "S!",
                action: "location failed",
                source: String::new(),
                destination: String::new(),
                reason: err.to_string(),
            })?;
            rows += 1;
        }
        for entry in &location.report.entries {
            writer.serialize(ReportRow {
                location: &location.name,
                identity: entry
                    .identity
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                symbol: entry.action.symbol(),
                action: entry.action.verb(),
                source: entry.source.display().to_string(),
                destination: entry.destination.display().to_string(),
                reason: entry.action.reason().unwrap_or_default().to_string(),
            })?;
            rows += 1;
        }
    }
    writer.flush()?;
    Ok(rows)
}
