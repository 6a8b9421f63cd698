use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "labsync")]
#[command(about = "Pull experiment data from satellite locations into the local tree", long_about = None)]
pub struct Cli {
    /// Increase transcript verbosity (-v: changes, -vv: every entry)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Report what would happen without touching any file
    #[arg(short = 'n', long = "dry-run", global = true)]
    pub dry_run: bool,

    /// Configuration file (default: ./Config.*)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, overrides TRACING_LEVEL (e.g. debug, labsync_core=trace)
    #[arg(long, global = true)]
    pub loglevel: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sync satellite locations into the local tree
    Sync(SyncArgs),
    /// Report folders that share an experiment or subentry identity
    CheckDuplicates(DuplicateArgs),
    /// List configured satellite locations
    ListLocations,
    /// Print the effective configuration as TOML
    PrintConfig,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Satellite locations to sync (default: all without donotsync)
    pub remotes: Vec<String>,

    /// Only sync these experiment ids
    #[arg(short, long, num_args = 1..)]
    pub expids: Option<Vec<String>>,

    /// Write every transcript entry to this CSV file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DuplicateArgs {
    /// Check subentries instead of experiments
    #[arg(long)]
    pub subentries: bool,

    /// Check the local tree (default when nothing else is selected)
    #[arg(long)]
    pub local: bool,

    /// Check these satellites; all of them when given without names
    #[arg(long, num_args = 0..)]
    pub remotes: Option<Vec<String>>,

    /// Compare folder names between the local tree and the satellites
    #[arg(long)]
    pub crosscheck: bool,

    /// Offer to rename cross-checked folders to match the first one
    #[arg(long, requires = "crosscheck")]
    pub rename: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}
