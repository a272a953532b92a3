//! Source-tree inventory: file records, PHP partitioning, classification and tree diffs.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::core::classify::{Classification, try_classify};
use crate::infra::io::write_atomic;
use crate::infra::walk::FileWalker;

/// One file of a tree, located relative to the tree root. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRecord {
    pub full_path: PathBuf,
    /// Directory relative to the root; empty for top-level files
    pub relative_dir: PathBuf,
    pub file_name: OsString,
}

impl FileRecord {
    /// Build a record for `full_path`, which must live under `root`.
    pub fn from_path(root: &Path, full_path: &Path) -> Result<Self> {
        let rel = full_path.strip_prefix(root).with_context(|| {
            format!("{} is not under {}", full_path.display(), root.display())
        })?;
        let file_name = rel
            .file_name()
            .with_context(|| format!("no file name: {}", full_path.display()))?
            .to_os_string();
        let relative_dir = rel.parent().map(Path::to_path_buf).unwrap_or_default();

        Ok(Self {
            full_path: full_path.to_path_buf(),
            relative_dir,
            file_name,
        })
    }

    /// `relativeDir/fileName` with `/` separators and no leading separator.
    /// Stable across runs and across source/destination trees.
    pub fn key(&self) -> String {
        let mut parts: Vec<String> = self
            .relative_dir
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        parts.push(self.file_name.to_string_lossy().into_owned());
        parts.join("/")
    }

    /// Mirrored location of this file under `dest_root`.
    pub fn dest_path(&self, dest_root: &Path) -> PathBuf {
        dest_root.join(&self.relative_dir).join(&self.file_name)
    }

    /// Suffix test, case-insensitive `.php`.
    pub fn is_php(&self) -> bool {
        self.file_name
            .to_string_lossy()
            .to_ascii_lowercase()
            .ends_with(".php")
    }
}

/// A source tree split by file suffix.
#[derive(Debug, Default)]
pub struct Inventory {
    pub php_files: Vec<FileRecord>,
    pub non_php_files: Vec<FileRecord>,
}

/// PHP files split by classification.
#[derive(Debug, Default)]
pub struct Partition {
    pub encoded: Vec<FileRecord>,
    pub plain: Vec<FileRecord>,
    /// Files whose prefix could not be read; they are also in `plain` (fail-open)
    pub unreadable: Vec<FileRecord>,
}

/// Walk `root` and split every file by suffix.
pub fn build_inventory(root: &Path, walker: &FileWalker) -> Result<Inventory> {
    let mut inv = Inventory::default();
    for path in walker.walk_files(root)? {
        let record = FileRecord::from_path(root, &path)?;
        if record.is_php() {
            inv.php_files.push(record);
        } else {
            inv.non_php_files.push(record);
        }
    }
    Ok(inv)
}

/// Only the PHP records of `root`.
pub fn php_files(root: &Path, walker: &FileWalker) -> Result<Vec<FileRecord>> {
    Ok(build_inventory(root, walker)?.php_files)
}

/// Classify each record afresh from its bytes; order is preserved.
pub fn classify_all(files: Vec<FileRecord>) -> Partition {
    let verdicts: Vec<_> = files.par_iter().map(|f| try_classify(&f.full_path)).collect();

    let mut part = Partition::default();
    for (file, verdict) in files.into_iter().zip(verdicts) {
        match verdict {
            Ok(Classification::Encoded) => part.encoded.push(file),
            Ok(Classification::Plain) => part.plain.push(file),
            Err(e) => {
                tracing::warn!(file = %file.key(), error = %e, "unreadable file, treating as plain");
                part.unreadable.push(file.clone());
                part.plain.push(file);
            }
        }
    }
    part
}

/// Source PHP files whose key is absent from the destination tree.
/// A missing destination directory means every source file is missing.
pub fn diff_trees(source: &Path, dest: &Path, walker: &FileWalker) -> Result<Vec<FileRecord>> {
    let src = php_files(source, walker)?;

    let dest_keys: HashSet<String> = if dest.is_dir() {
        php_files(dest, walker)?.iter().map(FileRecord::key).collect()
    } else {
        HashSet::new()
    };

    Ok(src
        .into_iter()
        .filter(|f| !dest_keys.contains(&f.key()))
        .collect())
}

/// Snapshot written by the repair workflow; never read back by later runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingFilesReport {
    pub timestamp: String,
    pub total_missing: usize,
    pub plain_files: Vec<String>,
    pub encoded_files: Vec<String>,
}

impl MissingFilesReport {
    pub fn from_partition(part: &Partition) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            total_missing: part.plain.len() + part.encoded.len(),
            plain_files: part.plain.iter().map(FileRecord::key).collect(),
            encoded_files: part.encoded.iter().map(FileRecord::key).collect(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("serialize report")?;
        write_atomic(path, text.as_bytes())
            .with_context(|| format!("write report {}", path.display()))
    }
}
