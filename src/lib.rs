//! **unshroud** - Migrate a tree of encoded PHP files into a plaintext mirror
//!
//! Copies what needs no decoding, sends each encoded file through a remote
//! decoding web service, and records progress so interrupted batches resume.

/// Command-line interface with clap integration
pub mod cli;

/// Migration pipeline - classification, inventory, remote decoding and batch control
pub mod core {
    /// Byte-prefix heuristics deciding encoded vs plain PHP
    pub mod classify;
    pub use classify::{Classification, classify};

    /// Persisted processed/failed sets for resumable batches
    pub mod ledger;
    pub use ledger::Ledger;

    /// File records, PHP partitioning and source/destination diffs
    pub mod inventory;
    pub use inventory::{FileRecord, MissingFilesReport, diff_trees};

    /// Blocking HTTP adapter with cookie-backed session and HTML form handling
    pub mod remote;
    pub use remote::{HttpRemote, Remote};

    /// Per-file decode state machine over an authenticated session
    pub mod session;
    pub use session::{DecodeSession, Decoder, FileOutcome};

    /// The `run` batch: mirror, copy, decode, record
    pub mod driver;
    pub use driver::run as batch_run;

    /// The `repair` workflow: diff, report, fill the gap
    pub mod repair;
    pub use repair::run as repair_run;

    /// Read-only classification of a tree
    pub mod scan;
    pub use scan::run as scan_run;

    /// Ledger summary
    pub mod status;
    pub use status::run as status_run;
}

/// Infrastructure - Configuration, I/O, and utilities
pub mod infra {
    /// Layered configuration: defaults, file, `UNSHROUD_*` environment
    pub mod config;
    pub use config::{Config, init as config_init, load_config};

    /// Atomic writes and copy/move helpers
    pub mod io;

    /// Directory walking with glob excludes
    pub mod walk;
    pub use walk::FileWalker;

    /// Console styling and small helpers
    pub mod utils;
}

pub use cli::{AppContext, Cli, Commands};
pub use core::{batch_run, repair_run, scan_run, status_run};
pub use infra::{Config, FileWalker, load_config};
