//! Batch driver for `unshroud run`.
//!
//! One run: mirror the directory skeleton, copy non-PHP and plain PHP files,
//! then decode every encoded file the ledger has not recorded as processed.
//! Decoding is strictly sequential through a single session; the ledger is
//! updated after every file, so an interrupted run resumes where it stopped.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tracing::{error, info, warn};

use crate::cli::{AppContext, RunArgs};
use crate::core::inventory::{FileRecord, build_inventory, classify_all};
use crate::core::ledger::{Ledger, with_run_lock};
use crate::core::remote::HttpRemote;
use crate::core::session::{DecodeSession, Decoder, FileOutcome, SessionError};
use crate::infra::config::Config;
use crate::infra::io::copy_file;
use crate::infra::utils::{Console, Paint, Pause};
use crate::infra::walk::FileWalker;

/// Decode results of one batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchTally {
    pub decoded: usize,
    pub failed: usize,
    /// `(key, reason)` for each failed file
    pub failures: Vec<(String, String)>,
}

/// Everything a run did, phase by phase.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub dirs_mirrored: usize,
    pub assets_copied: usize,
    pub plain_copied: usize,
    pub copy_failures: usize,
    pub encoded: usize,
    pub unreadable: usize,
    pub already_processed: usize,
    pub remaining: usize,
    pub session_opened: bool,
    pub tally: BatchTally,
}

pub fn run(args: RunArgs, cfg: &Config, ctx: &AppContext) -> Result<()> {
    let cfg = cfg.clone().with_run_args(&args);
    cfg.validate_trees()?;

    let open = || {
        HttpRemote::new()
            .map_err(SessionError::Client)
            .and_then(|remote| DecodeSession::open(&cfg, remote))
    };

    let summary = if ctx.dry_run {
        run_batch(&cfg, ctx, open)?
    } else {
        with_run_lock(&cfg.paths.ledger_file, || run_batch(&cfg, ctx, open))?
    };

    print_summary(&summary, ctx);
    Ok(())
}

/// Execute one batch; `open` is called at most once, and only when work remains.
pub fn run_batch<D, F>(cfg: &Config, ctx: &AppContext, open: F) -> Result<RunSummary>
where
    D: Decoder,
    F: FnOnce() -> Result<D, SessionError>,
{
    let source = &cfg.paths.source_dir;
    let dest = &cfg.paths.dest_dir;
    let walker = FileWalker::new(&cfg.exclude)?;
    let mut summary = RunSummary::default();

    Console::phase(ctx, 1, "Scanning source tree...");
    let inventory = build_inventory(source, &walker)?;
    Console::line(
        ctx,
        &format!(
            "PHP files: {}, other files: {}",
            inventory.php_files.len(),
            inventory.non_php_files.len()
        ),
    );

    Console::phase(ctx, 2, "Mirroring directories and copying non-PHP files...");
    if !ctx.dry_run {
        summary.dirs_mirrored = mirror_dirs(source, dest, &walker)?;
        let (copied, failed) = copy_records(&inventory.non_php_files, dest);
        summary.assets_copied = copied;
        summary.copy_failures += failed;
    }
    Console::line(ctx, &format!("Total: {} files", summary.assets_copied));

    Console::phase(ctx, 3, "Classifying PHP files...");
    let partition = classify_all(inventory.php_files);
    summary.encoded = partition.encoded.len();
    summary.unreadable = partition.unreadable.len();
    Console::line(ctx, &format!("Encoded: {}", partition.encoded.len()));
    Console::line(ctx, &format!("Plain: {}", partition.plain.len()));
    for f in &partition.unreadable {
        Console::line(
            ctx,
            &Paint::warn(ctx, &format!("unreadable, treated as plain: {}", f.key())),
        );
    }

    Console::phase(ctx, 4, "Copying plain PHP files...");
    if !ctx.dry_run {
        let (copied, failed) = copy_records(&partition.plain, dest);
        summary.plain_copied = copied;
        summary.copy_failures += failed;
    }
    Console::line(ctx, &format!("Copied: {}", summary.plain_copied));

    Console::phase(ctx, 5, "Decoding encoded files...");
    let mut ledger = Ledger::load(&cfg.paths.ledger_file);
    let remaining = ledger.remaining(&partition.encoded);
    summary.already_processed = partition.encoded.len() - remaining.len();
    summary.remaining = remaining.len();
    Console::line(ctx, &format!("Previously processed: {}", summary.already_processed));
    Console::line(ctx, &format!("Remaining: {}", remaining.len()));

    if remaining.is_empty() {
        Console::line(ctx, &Paint::ok(ctx, "All encoded files already processed."));
        return Ok(summary);
    }

    if ctx.dry_run {
        for f in &remaining {
            Console::line(ctx, &Paint::warn(ctx, &format!("would decode {}", f.key())));
        }
        return Ok(summary);
    }

    let mut decoder = match open() {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "could not open decode session");
            Console::line(
                ctx,
                &Paint::err(ctx, "Progress has been saved. Run again to resume."),
            );
            return Err(anyhow::Error::new(e).context("decode session failed to start"));
        }
    };
    summary.session_opened = true;

    summary.tally = decode_all(&mut decoder, &remaining, &mut ledger, cfg, ctx);
    Ok(summary)
}

/// Decode `files` in order, recording each outcome in the ledger as it happens.
pub fn decode_all<D: Decoder>(
    decoder: &mut D,
    files: &[&FileRecord],
    ledger: &mut Ledger,
    cfg: &Config,
    ctx: &AppContext,
) -> BatchTally {
    let progress = if ctx.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    };

    let mut tally = BatchTally::default();
    for (i, file) in files.iter().enumerate() {
        let key = file.key();
        progress.set_message(key.clone());

        match decoder.decode(file) {
            FileOutcome::Decoded(path) => {
                info!(file = %key, dest = %path.display(), "decoded");
                ledger.mark_processed(&key);
                tally.decoded += 1;
            }
            FileOutcome::Failed(failure) => {
                warn!(file = %key, "decode failed: {failure}");
                ledger.mark_failed(&key);
                tally.failed += 1;
                tally.failures.push((key, failure.to_string()));
            }
        }
        progress.inc(1);

        if i + 1 < files.len() {
            Pause::for_duration(cfg.tuning.delay_between_files());
        }
    }
    progress.finish_with_message("decoding complete");
    tally
}

/// Recreate the source directory skeleton (including empty dirs) under `dest`.
pub fn mirror_dirs(source: &Path, dest: &Path, walker: &FileWalker) -> Result<usize> {
    std::fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let dirs = walker.walk_dirs(source)?;
    for dir in &dirs {
        let rel = dir.strip_prefix(source).unwrap_or(dir);
        let target = dest.join(rel);
        std::fs::create_dir_all(&target)
            .with_context(|| format!("create {}", target.display()))?;
    }
    Ok(dirs.len())
}

/// Copy each record to its mirrored path, overwriting. Returns `(copied, failed)`.
pub fn copy_records(records: &[FileRecord], dest: &Path) -> (usize, usize) {
    let mut copied = 0;
    let mut failed = 0;
    for r in records {
        match copy_file(&r.full_path, &r.dest_path(dest)) {
            Ok(_) => copied += 1,
            Err(e) => {
                warn!(file = %r.key(), error = %format!("{e:#}"), "copy failed");
                failed += 1;
            }
        }
    }
    copied_log(copied, failed);
    (copied, failed)
}

fn copied_log(copied: usize, failed: usize) {
    if failed > 0 {
        warn!(copied, failed, "some files could not be copied");
    } else {
        info!(copied, "files copied");
    }
}

pub fn print_summary(summary: &RunSummary, ctx: &AppContext) {
    if ctx.quiet {
        return;
    }
    println!();
    Console::rule(ctx);
    let title = if ctx.dry_run { "Dry run complete" } else { "Processing complete!" };
    println!("{}", Paint::heading(ctx, title));
    Console::line(ctx, &format!("Non-PHP files copied: {}", summary.assets_copied));
    Console::line(ctx, &format!("Plain PHP files copied: {}", summary.plain_copied));
    if summary.copy_failures > 0 {
        Console::line(
            ctx,
            &Paint::err(ctx, &format!("Copy failures: {}", summary.copy_failures)),
        );
    }
    Console::line(ctx, &format!("Encoded files: {}", summary.encoded));
    Console::line(ctx, &format!("Previously processed: {}", summary.already_processed));
    Console::line(
        ctx,
        &Paint::ok(ctx, &format!("✓ Successfully decoded: {}", summary.tally.decoded)),
    );
    if summary.tally.failed > 0 {
        Console::line(
            ctx,
            &Paint::err(ctx, &format!("✗ Failed: {}", summary.tally.failed)),
        );
        for (key, reason) in &summary.tally.failures {
            Console::line(ctx, &format!("    {key}: {reason}"));
        }
    }
    Console::rule(ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::{DecodeError, DecodeFailure, DecodeState};
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    /// Decodes by copying, failing for the listed keys.
    struct FakeDecoder {
        dest: std::path::PathBuf,
        fail: HashSet<&'static str>,
        seen: Vec<String>,
    }

    impl Decoder for FakeDecoder {
        fn decode(&mut self, file: &FileRecord) -> FileOutcome {
            let key = file.key();
            self.seen.push(key.clone());
            if self.fail.contains(key.as_str()) {
                return FileOutcome::Failed(DecodeFailure {
                    state: DecodeState::Uploaded,
                    error: DecodeError::NoFileInput,
                });
            }
            let out = file.dest_path(&self.dest);
            fs::create_dir_all(out.parent().unwrap()).unwrap();
            fs::write(&out, b"<?php // decoded").unwrap();
            FileOutcome::Decoded(out)
        }
    }

    fn touch(root: &Path, rel: &str, body: &[u8]) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, body).unwrap();
    }

    fn encoded() -> Vec<u8> {
        let mut b = b"<?php //0046a\n".to_vec();
        b.extend([0x01u8; 64]);
        b
    }

    fn setup() -> (TempDir, Config) {
        let tmp = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.paths.source_dir = tmp.path().join("code");
        cfg.paths.dest_dir = tmp.path().join("source");
        cfg.paths.staging_dir = tmp.path().join("staging");
        cfg.paths.ledger_file = tmp.path().join("progress.json");
        cfg.tuning.delay_between_files_ms = 0;

        let src = &cfg.paths.source_dir;
        touch(src, "index.php", b"<?php function main() { return 1; }");
        touch(src, "a.php", &encoded());
        touch(src, "lib/b.php", &encoded());
        touch(src, "css/site.css", b"body{}");
        fs::create_dir_all(src.join("cache/empty")).unwrap();
        (tmp, cfg)
    }

    fn quiet() -> AppContext {
        AppContext {
            quiet: true,
            ..AppContext::default()
        }
    }

    fn fake(cfg: &Config, fail: &[&'static str]) -> FakeDecoder {
        FakeDecoder {
            dest: cfg.paths.dest_dir.clone(),
            fail: fail.iter().copied().collect(),
            seen: Vec::new(),
        }
    }

    #[test]
    fn mirrors_copies_and_decodes() {
        let (_tmp, cfg) = setup();
        let summary = run_batch(&cfg, &quiet(), || Ok(fake(&cfg, &[]))).unwrap();

        let dst = &cfg.paths.dest_dir;
        assert!(dst.join("cache/empty").is_dir());
        assert_eq!(fs::read(dst.join("css/site.css")).unwrap(), b"body{}");
        assert!(dst.join("index.php").is_file());
        assert!(dst.join("lib/b.php").is_file());
        assert_eq!(summary.encoded, 2);
        assert_eq!(summary.plain_copied, 1);
        assert_eq!(summary.tally.decoded, 2);

        let ledger = Ledger::load(&cfg.paths.ledger_file);
        assert!(ledger.contains("a.php"));
        assert!(ledger.contains("lib/b.php"));
    }

    #[test]
    fn failure_is_isolated_and_recorded() {
        let (_tmp, cfg) = setup();
        let summary = run_batch(&cfg, &quiet(), || Ok(fake(&cfg, &["a.php"]))).unwrap();

        assert_eq!(summary.tally.decoded, 1);
        assert_eq!(summary.tally.failed, 1);
        assert_eq!(summary.tally.failures[0].0, "a.php");
        assert!(!cfg.paths.dest_dir.join("a.php").exists());

        let ledger = Ledger::load(&cfg.paths.ledger_file);
        assert!(ledger.is_failed("a.php"));
        assert!(!ledger.contains("a.php"));
        assert!(ledger.contains("lib/b.php"));
    }

    #[test]
    fn processed_files_are_not_decoded_again() {
        let (_tmp, cfg) = setup();
        let mut ledger = Ledger::load(&cfg.paths.ledger_file);
        ledger.mark_processed("lib/b.php");

        let summary = run_batch(&cfg, &quiet(), || Ok(fake(&cfg, &[]))).unwrap();

        assert_eq!(summary.already_processed, 1);
        assert_eq!(summary.remaining, 1);
        assert_eq!(summary.tally.decoded, 1);
    }

    #[test]
    fn session_not_opened_when_nothing_remains() {
        let (_tmp, cfg) = setup();
        let mut ledger = Ledger::load(&cfg.paths.ledger_file);
        ledger.mark_processed("a.php");
        ledger.mark_processed("lib/b.php");

        let summary = run_batch::<FakeDecoder, _>(&cfg, &quiet(), || {
            panic!("session must not be opened")
        })
        .unwrap();
        assert!(!summary.session_opened);
        assert_eq!(summary.remaining, 0);
    }

    #[test]
    fn session_failure_aborts_but_keeps_copies() {
        let (_tmp, cfg) = setup();
        let err = run_batch::<FakeDecoder, _>(&cfg, &quiet(), || Err(SessionError::Rejected))
            .unwrap_err();

        assert!(format!("{err:#}").contains("credentials rejected"));
        assert!(cfg.paths.dest_dir.join("index.php").is_file());
        assert_eq!(Ledger::load(&cfg.paths.ledger_file).processed_count(), 0);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let (_tmp, cfg) = setup();
        let ctx = AppContext {
            quiet: true,
            dry_run: true,
            ..AppContext::default()
        };
        let summary = run_batch::<FakeDecoder, _>(&cfg, &ctx, || panic!("no session in dry run"))
            .unwrap();

        assert_eq!(summary.remaining, 2);
        assert!(!cfg.paths.dest_dir.exists());
        assert!(!cfg.paths.ledger_file.exists());
    }

    #[test]
    fn decode_all_visits_in_order() {
        let (_tmp, cfg) = setup();
        let root = &cfg.paths.source_dir;
        let files: Vec<FileRecord> = ["a.php", "lib/b.php"]
            .iter()
            .map(|k| FileRecord::from_path(root, &root.join(k)).unwrap())
            .collect();
        let refs: Vec<&FileRecord> = files.iter().collect();
        let mut ledger = Ledger::load(&cfg.paths.ledger_file);
        let mut dec = fake(&cfg, &[]);

        let tally = decode_all(&mut dec, &refs, &mut ledger, &cfg, &quiet());
        assert_eq!(dec.seen, vec!["a.php", "lib/b.php"]);
        assert_eq!(tally.decoded, 2);
    }
}
