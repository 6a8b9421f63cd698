use colored::*;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use labsync_core::{Error, IdentityKey, SyncAction, SyncEntry, SyncObserver, SyncSummary};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Terminal observer: one spinner per location while its catalog is built,
/// then transcript lines for the entries the reconciler passes on.
pub struct CliObserver {
    verbosity: u8,
    multi: MultiProgress,
    bars: Mutex<HashMap<String, (ProgressBar, Instant)>>,
}

impl CliObserver {
    pub fn new(verbosity: u8) -> Self {
        Self {
            verbosity,
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Transcript lines go above the spinners; a hidden draw target (output
    /// is not a terminal) would swallow them.
    fn line(&self, text: String) {
        if self.multi.is_hidden() || self.multi.println(&text).is_err() {
            println!("{}", text);
        }
    }

    fn finish(&self, location: &str) -> Option<Duration> {
        let mut bars = self.bars.lock().ok()?;
        let (pb, started) = bars.remove(location)?;
        pb.finish_and_clear();
        self.multi.remove(&pb);
        Some(started.elapsed())
    }
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// `N`, `O`, `S` or `S!`, colored by severity.
pub fn symbol(action: &SyncAction) -> ColoredString {
    match action {
        SyncAction::CopyTree | SyncAction::CopyFile => action.symbol().green(),
        SyncAction::Overwrite => action.symbol().yellow(),
        SyncAction::Current | SyncAction::Excluded => action.symbol().dimmed(),
        SyncAction::Unexpected(_) | SyncAction::Failed(_) => action.symbol().red().bold(),
    }
}

impl SyncObserver for CliObserver {
    fn on_location_start(&self, location: &str, granularity: &str) {
        let pb = self
            .multi
            .add(spinner(format!("Cataloging {} ({} folders)...", location, granularity)));
        if let Ok(mut bars) = self.bars.lock() {
            if let Some((old, _)) = bars.insert(location.to_string(), (pb, Instant::now())) {
                old.finish_and_clear();
            }
        }
    }

    fn on_location_skipped(&self, location: &str, reason: &str) {
        if self.verbosity >= 1 {
            self.line(format!("  {} {} skipped: {}", "-".dimmed(), location, reason));
        }
    }

    fn on_catalog_built(&self, location: &str, identities: usize) {
        if let Ok(bars) = self.bars.lock() {
            if let Some((pb, _)) = bars.get(location) {
                pb.set_message(format!("Syncing {} ({} folders)...", location, identities));
            }
        }
    }

    fn on_identity_start(&self, location: &str, key: &IdentityKey, remote: &Path, local: &Path) {
        if self.verbosity >= 1 {
            self.line(format!(
                "[{}] {}: {} -> {}",
                location.cyan(),
                key.to_string().bold(),
                remote.display(),
                local.display()
            ));
        }
    }

    fn on_entry(&self, _location: &str, entry: &SyncEntry) {
        let mut text = format!(
            "{}\t{}\t{}\t{}",
            symbol(&entry.action),
            entry.action.verb(),
            entry.source.display(),
            entry.destination.display()
        );
        if let Some(reason) = entry.action.reason() {
            text.push_str(&format!("\t({})", reason));
        }
        self.line(text);
    }

    fn on_location_complete(&self, location: &str, summary: &SyncSummary) {
        let elapsed = self.finish(location).unwrap_or_default();
        eprintln!(
            "  {} {}: {} new folders, {} new files, {} overwritten, {} skipped in {:.2}s",
            "✓".green(),
            location,
            summary.copied_trees,
            summary.copied_files,
            summary.overwritten,
            summary.skipped(),
            elapsed.as_secs_f64()
        );
    }

    fn on_location_failed(&self, location: &str, error: &Error) {
        self.finish(location);
        eprintln!("  {} {}: {}", "✗".red(), location, error);
    }
}
