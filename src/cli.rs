use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Shared application context for global flags
#[derive(Clone, Debug, Default)]
pub struct AppContext {
    pub quiet: bool,    // global --quiet
    pub no_color: bool, // global --no-color
    pub dry_run: bool,  // global --dry-run
}

#[derive(Parser)]
#[command(name = "unshroud")]
#[command(
    about = "Mirror an encoded PHP tree into plaintext, decoding protected files through a remote service"
)]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Explicit configuration file (defaults to ./unshroud.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Suppress progress bars and non-essential output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Show what would be done without executing
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy plain files and decode every encoded PHP file not yet in the ledger
    Run(RunArgs),

    /// Find PHP files missing from the destination and fix them up
    Repair(RepairArgs),

    /// Classify the source tree without touching the destination
    Scan(ScanArgs),

    /// Show ledger progress
    Status(StatusArgs),

    /// Initialize an unshroud.toml config file
    Init(InitArgs),
}

/// Path overrides shared by the commands that read the source tree.
#[derive(Debug, Clone, Default, Args)]
pub struct PathOverrides {
    /// Source tree (encoded mirror)
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Destination tree (plaintext mirror)
    #[arg(long)]
    pub dest: Option<PathBuf>,
}

#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
    #[command(flatten)]
    pub paths: PathOverrides,

    /// Scratch directory for downloaded files
    #[arg(long)]
    pub staging: Option<PathBuf>,

    /// Ledger file tracking processed/failed files
    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// Delay between decoded files in milliseconds
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Attempts per encoded file before it is recorded as failed
    #[arg(long)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Parser)]
pub struct RepairArgs {
    #[command(flatten)]
    pub paths: PathOverrides,

    /// Where to write the missing-files report
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Stop after writing the report
    #[arg(long)]
    pub report_only: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct ScanArgs {
    /// Source tree to classify (defaults to the configured source)
    pub path: Option<PathBuf>,

    /// Print every PHP file with its classification
    #[arg(long)]
    pub list: bool,

    /// Emit a JSON document instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct StatusArgs {
    /// Ledger file (defaults to the configured ledger)
    #[arg(long)]
    pub ledger: Option<PathBuf>,
}

#[derive(Debug, Clone, Parser)]
pub struct InitArgs {
    /// Directory to initialize config in
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Overwrite existing config file
    #[arg(long)]
    pub force: bool,
}
