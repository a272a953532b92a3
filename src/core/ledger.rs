//! Persisted per-file progress enabling resumable batches.
//!
//! The ledger is a single JSON document `{ "processed": [..], "failed": [..] }`.
//! Every mutation rewrites the whole document atomically before returning, so a
//! crash mid-batch loses at most the file in flight. `failed` is advisory: a key
//! may later also appear in `processed` after a successful retry.

use anyhow::{Context, Result};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::inventory::FileRecord;
use crate::infra::io::write_atomic;

/// On-disk shape of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerDoc {
    #[serde(default)]
    pub processed: IndexSet<String>,
    #[serde(default)]
    pub failed: IndexSet<String>,
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    doc: LedgerDoc,
}

impl Ledger {
    /// Load the ledger at `path`; a missing or corrupt file yields an empty ledger.
    pub fn load(path: &Path) -> Self {
        let doc = match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<LedgerDoc>(&text) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(ledger = %path.display(), error = %e, "corrupt ledger, starting fresh");
                    LedgerDoc::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(ledger = %path.display(), "no ledger yet");
                LedgerDoc::default()
            }
            Err(e) => {
                warn!(ledger = %path.display(), error = %e, "unreadable ledger, starting fresh");
                LedgerDoc::default()
            }
        };

        Self {
            path: path.to_path_buf(),
            doc,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `key` was durably written to the destination in some run.
    pub fn contains(&self, key: &str) -> bool {
        self.doc.processed.contains(key)
    }

    pub fn is_failed(&self, key: &str) -> bool {
        self.doc.failed.contains(key)
    }

    pub fn processed_count(&self) -> usize {
        self.doc.processed.len()
    }

    /// Failed keys that never made it into `processed`.
    pub fn outstanding_failures(&self) -> Vec<&str> {
        self.doc
            .failed
            .iter()
            .filter(|k| !self.doc.processed.contains(*k))
            .map(String::as_str)
            .collect()
    }

    /// `files − processed`, preserving input order.
    pub fn remaining<'a>(&self, files: &'a [FileRecord]) -> Vec<&'a FileRecord> {
        files.iter().filter(|f| !self.contains(&f.key())).collect()
    }

    /// Record a durable success and persist.
    pub fn mark_processed(&mut self, key: &str) {
        if self.doc.processed.insert(key.to_string()) {
            self.persist_logged(key);
        }
    }

    /// Record a failed attempt and persist.
    pub fn mark_failed(&mut self, key: &str) {
        if self.doc.failed.insert(key.to_string()) {
            self.persist_logged(key);
        }
    }

    /// Rewrite the whole document atomically.
    pub fn flush(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.doc).context("serialize ledger")?;
        write_atomic(&self.path, text.as_bytes())
            .with_context(|| format!("write ledger {}", self.path.display()))
    }

    // A failed write keeps the in-memory state; the next mutation retries the full rewrite.
    fn persist_logged(&self, key: &str) {
        if let Err(e) = self.flush() {
            warn!(file = key, error = %format!("{e:#}"), "ledger write failed; outcome not yet durable");
        }
    }
}

/// Run `f` while holding an exclusive advisory lock on `<ledger>.lock`.
/// A second process trying the same fails fast instead of racing on the ledger.
pub fn with_run_lock<T>(ledger_path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let mut lock_path = ledger_path.as_os_str().to_owned();
    lock_path.push(".lock");
    let lock_path = PathBuf::from(lock_path);

    if let Some(parent) = lock_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("open lock file {}", lock_path.display()))?;

    let mut lock = fd_lock::RwLock::new(file);
    let _guard = lock.try_write().with_context(|| {
        format!(
            "another run holds {}; wait for it to finish",
            lock_path.display()
        )
    })?;

    f()
}
