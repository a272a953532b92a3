//! `unshroud scan`: classify the source tree without writing anything.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;

use crate::cli::{AppContext, ScanArgs};
use crate::core::inventory::{FileRecord, Inventory, Partition, build_inventory, classify_all};
use crate::infra::config::Config;
use crate::infra::utils::{Console, Paint};
use crate::infra::walk::FileWalker;

/// Machine-readable result of a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub root: String,
    pub non_php_files: usize,
    pub encoded: Vec<String>,
    pub plain: Vec<String>,
    pub unreadable: Vec<String>,
}

impl ScanReport {
    fn new(root: &std::path::Path, inv: &Inventory, part: &Partition) -> Self {
        let keys = |v: &[FileRecord]| v.iter().map(FileRecord::key).collect::<Vec<_>>();
        Self {
            root: root.display().to_string(),
            non_php_files: inv.non_php_files.len(),
            encoded: keys(&part.encoded),
            plain: keys(&part.plain),
            unreadable: keys(&part.unreadable),
        }
    }
}

/// Classify every PHP file under `root`.
pub fn scan_tree(root: &std::path::Path, cfg: &Config) -> Result<ScanReport> {
    let walker = FileWalker::new(&cfg.exclude)?;
    let mut inv = build_inventory(root, &walker)?;
    let part = classify_all(std::mem::take(&mut inv.php_files));
    Ok(ScanReport::new(root, &inv, &part))
}

pub fn run(args: ScanArgs, cfg: &Config, ctx: &AppContext) -> Result<()> {
    let root = args
        .path
        .clone()
        .unwrap_or_else(|| cfg.paths.source_dir.clone());
    let report = scan_tree(&root, cfg)?;

    if args.json {
        let text = serde_json::to_string_pretty(&report).context("serialize scan report")?;
        println!("{text}");
        return Ok(());
    }

    if args.list {
        let unreadable: HashSet<&str> = report.unreadable.iter().map(String::as_str).collect();
        for key in &report.encoded {
            println!("{}\t{key}", Paint::warn(ctx, "encoded"));
        }
        for key in &report.plain {
            let label = if unreadable.contains(key.as_str()) { "unreadable" } else { "plain" };
            println!("{}\t{key}", Paint::ok(ctx, label));
        }
    }

    Console::line(ctx, &format!("Root: {}", report.root));
    Console::line(ctx, &format!("Non-PHP files: {}", report.non_php_files));
    Console::line(ctx, &format!("Encoded PHP files: {}", report.encoded.len()));
    Console::line(ctx, &format!("Plain PHP files: {}", report.plain.len()));
    if !report.unreadable.is_empty() {
        Console::line(
            ctx,
            &Paint::warn(ctx, &format!("Unreadable (counted as plain): {}", report.unreadable.len())),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scan_reports_each_class() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("plain.php"), "<?php function f() { return 1; }").unwrap();
        fs::write(root.join("enc.php"), b"<?php //0046\x00\x01").unwrap();
        fs::write(root.join("logo.png"), [0x89u8, 0x50]).unwrap();

        let report = scan_tree(root, &Config::default()).unwrap();
        assert_eq!(report.encoded, vec!["enc.php"]);
        assert_eq!(report.plain, vec!["plain.php"]);
        assert_eq!(report.non_php_files, 1);
        assert!(report.unreadable.is_empty());
    }
}
