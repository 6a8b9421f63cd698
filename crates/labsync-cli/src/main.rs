mod commands;
mod logging;
mod progress;
mod report;

use std::io::{self, Write};
use std::process;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, DuplicateArgs, SyncArgs};
use dotenv::dotenv;
use labsync_core::config::{load_configuration, load_from};
use labsync_core::{AppConfig, DuplicateGroup, DuplicateRequest, SyncOptions, SyncOrchestrator};
use progress::CliObserver;
use tracing::{error, info, warn};

fn main() {
    dotenv().ok();

    let args = Cli::parse();
    let _guard = logging::init_logger(args.loglevel.as_deref());

    let loaded = match &args.config {
        Some(path) => load_from(path),
        None => load_configuration(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let result = match &args.command {
        Some(Commands::Sync(sync)) => run_sync(&config, &args, sync),
        Some(Commands::CheckDuplicates(dups)) => run_check_duplicates(&config, &args, dups),
        Some(Commands::ListLocations) => run_list_locations(&config),
        Some(Commands::PrintConfig) => config
            .to_toml()
            .map(|text| println!("{}", text))
            .context("cannot render configuration"),
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = result {
        match err.downcast_ref::<labsync_core::Error>() {
            Some(core) if core.is_configuration() => error!("Configuration error: {}", core),
            _ => error!("Error: {:#}", err),
        }
        process::exit(1);
    }
}

fn run_sync(config: &AppConfig, args: &Cli, sync: &SyncArgs) -> Result<()> {
    let mut orchestrator = SyncOrchestrator::from_config(config)?;
    let observer = CliObserver::new(args.verbose);
    let options = SyncOptions {
        dry_run: args.dry_run,
        verbosity: args.verbose,
        only: sync.expids.clone(),
    };

    println!(
        "{} sync started {}{}",
        "labsync".bold(),
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        if args.dry_run { " (dry run)".yellow().to_string() } else { String::new() }
    );
    let report = orchestrator.sync_all(&sync.remotes, &options, &observer)?;

    if let Some(path) = &sync.report {
        let rows = report::write_csv(path, &report)?;
        info!("Wrote {} report rows to {}", rows, path.display());
    }

    let summary = report.summary();
    println!(
        "{} sync finished {}: {} new folders, {} new files, {} overwritten, {} skipped ({} unexpected, {} failed)",
        "labsync".bold(),
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        summary.copied_trees.to_string().green(),
        summary.copied_files.to_string().green(),
        summary.overwritten.to_string().yellow(),
        summary.skipped(),
        summary.unexpected.to_string().red(),
        summary.failed.to_string().red(),
    );
    for failed in report.failed_locations() {
        if let labsync_core::orchestrator::LocationOutcome::Failed(err) = &failed.outcome {
            warn!("Location '{}' was not synced: {}", failed.name, err);
        }
    }
    Ok(())
}

fn print_groups(title: &str, groups: &[DuplicateGroup]) {
    println!("\n{}", title.bold());
    if groups.is_empty() {
        println!("  (none)");
    }
    for group in groups {
        println!("\n{}:", group.identity.to_string().cyan());
        for located in &group.paths {
            println!("- [{}] {}", located.location, located.path.display());
        }
    }
}

fn run_check_duplicates(config: &AppConfig, args: &Cli, dups: &DuplicateArgs) -> Result<()> {
    let mut orchestrator = SyncOrchestrator::from_config(config)?;
    let request = DuplicateRequest {
        subentries: dups.subentries,
        local: dups.local,
        remotes: dups.remotes.clone(),
        crosscheck: dups.crosscheck,
    };
    let report = orchestrator.check_duplicates(&request)?;
    let what = if dups.subentries { "subentries" } else { "experiments" };

    if dups.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if let Some(local) = &report.local {
            print_groups(&format!("Duplicate local {}:", what), local);
        }
        for (name, groups) in &report.remotes {
            print_groups(&format!("Duplicate {} on remote {}:", what, name), groups);
        }
        if let Some(groups) = &report.crosscheck {
            print_groups(
                &format!("Folders where local and remote {} differ (or are duplicated):", what),
                groups,
            );
        }
        for (name, reason) in &report.skipped {
            println!("{} {} skipped: {}", "-".dimmed(), name, reason);
        }
    }

    if !dups.rename {
        return Ok(());
    }
    let groups = report.crosscheck.unwrap_or_default();
    'groups: for group in &groups {
        for proposal in group.rename_proposals() {
            let prompt = format!(
                "Rename (from/to):\n- {}\n- {}\n?",
                proposal.from.display(),
                proposal.to.display()
            );
            match prompt_choice(&prompt)? {
                Answer::Yes if args.dry_run => {
                    println!("{} rename {} (dry run)", "N".green(), proposal.from.display())
                }
                Answer::Yes => match orchestrator.apply_rename(&proposal) {
                    Ok(path) => println!("{} renamed to {}", "✓".green(), path.display()),
                    Err(err) => error!("Could not rename {}: {}", proposal.from.display(), err),
                },
                Answer::No => {}
                Answer::Skip => break,
                Answer::Quit => break 'groups,
            }
        }
    }
    Ok(())
}

fn run_list_locations(config: &AppConfig) -> Result<()> {
    let orchestrator = SyncOrchestrator::from_config(config)?;
    let local = orchestrator.local();
    println!(
        "{}\t{}\t{}",
        local.name().bold(),
        local.root().display(),
        local.scheme()
    );
    for location in orchestrator.satellites() {
        let granularity = location
            .granularity()
            .map(|g| g.to_string())
            .unwrap_or_else(|_| "unsupported".red().to_string());
        let mounted = if location.is_mounted() {
            "mounted".green()
        } else {
            "not mounted".yellow()
        };
        println!(
            "{}\t{}\t{}\t{}\t{}{}",
            location.name().bold(),
            location.root().display(),
            location.scheme(),
            granularity,
            mounted,
            if location.donotsync() { "\tdonotsync" } else { "" }
        );
        if let Some(description) = location.description() {
            println!("\t{}", description.dimmed());
        }
        if !location.excludes().is_empty() {
            println!("\texcluding {}", location.excludes().join(", ").dimmed());
        }
    }
    Ok(())
}

enum Answer {
    Yes,
    No,
    /// Leave the rest of this group alone.
    Skip,
    Quit,
}

fn prompt_choice(prompt: &str) -> io::Result<Answer> {
    let mut input = String::new();

    loop {
        input.clear();
        print!("{} (y/N/skip/quit): ", prompt);
        io::stdout().flush()?;

        if io::stdin().read_line(&mut input)? == 0 {
            return Ok(Answer::Quit);
        }

        match input.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(Answer::Yes),
            "n" | "no" | "" => return Ok(Answer::No),
            "s" | "skip" | "break" => return Ok(Answer::Skip),
            "q" | "quit" => return Ok(Answer::Quit),
            _ => continue,
        }
    }
}
