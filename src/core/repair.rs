//! `unshroud repair`: find PHP files present in the source tree but absent
//! from the destination, then fill the gap.

use anyhow::Result;
use tracing::{error, info};

use crate::cli::{AppContext, RepairArgs};
use crate::core::driver::{BatchTally, copy_records, decode_all};
use crate::core::inventory::{FileRecord, MissingFilesReport, classify_all, diff_trees};
use crate::core::ledger::{Ledger, with_run_lock};
use crate::core::remote::HttpRemote;
use crate::core::session::{DecodeSession, Decoder, SessionError};
use crate::infra::config::Config;
use crate::infra::utils::{Console, Paint};
use crate::infra::walk::FileWalker;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RepairSummary {
    pub missing: usize,
    pub plain_missing: usize,
    pub encoded_missing: usize,
    pub plain_copied: usize,
    pub copy_failures: usize,
    pub report_written: bool,
    pub session_opened: bool,
    pub tally: BatchTally,
}

pub fn run(args: RepairArgs, cfg: &Config, ctx: &AppContext) -> Result<()> {
    let cfg = cfg.clone().with_repair_args(&args);
    cfg.validate_trees()?;

    let open = || {
        HttpRemote::new()
            .map_err(SessionError::Client)
            .and_then(|remote| DecodeSession::open(&cfg, remote))
    };

    let summary = if ctx.dry_run || args.report_only {
        repair_with(&cfg, ctx, args.report_only, open)?
    } else {
        with_run_lock(&cfg.paths.ledger_file, || {
            repair_with(&cfg, ctx, args.report_only, open)
        })?
    };

    print_summary(&summary, ctx);
    Ok(())
}

/// Diff, report, then copy/decode the missing files unless `report_only`.
pub fn repair_with<D, F>(
    cfg: &Config,
    ctx: &AppContext,
    report_only: bool,
    open: F,
) -> Result<RepairSummary>
where
    D: Decoder,
    F: FnOnce() -> Result<D, SessionError>,
{
    let walker = FileWalker::new(&cfg.exclude)?;
    let mut summary = RepairSummary::default();

    Console::phase(ctx, 1, "Comparing source and destination trees...");
    let missing = diff_trees(&cfg.paths.source_dir, &cfg.paths.dest_dir, &walker)?;
    summary.missing = missing.len();
    Console::line(ctx, &format!("Missing PHP files: {}", missing.len()));

    if missing.is_empty() {
        Console::line(ctx, &Paint::ok(ctx, "All files are present."));
        return Ok(summary);
    }

    Console::phase(ctx, 2, "Classifying missing files...");
    let partition = classify_all(missing);
    summary.plain_missing = partition.plain.len();
    summary.encoded_missing = partition.encoded.len();
    Console::line(ctx, &format!("Plain: {}", partition.plain.len()));
    Console::line(ctx, &format!("Encoded: {}", partition.encoded.len()));

    let report = MissingFilesReport::from_partition(&partition);
    if ctx.dry_run {
        Console::line(
            ctx,
            &format!("would write report to {}", cfg.paths.report_file.display()),
        );
    } else {
        report.write(&cfg.paths.report_file)?;
        summary.report_written = true;
        info!(report = %cfg.paths.report_file.display(), "missing files report written");
        Console::line(
            ctx,
            &format!("Report: {}", cfg.paths.report_file.display()),
        );
    }

    if report_only || ctx.dry_run {
        list(ctx, "plain", &partition.plain);
        list(ctx, "encoded", &partition.encoded);
        return Ok(summary);
    }

    Console::phase(ctx, 3, "Copying missing plain files...");
    let (copied, failed) = copy_records(&partition.plain, &cfg.paths.dest_dir);
    summary.plain_copied = copied;
    summary.copy_failures = failed;
    Console::line(ctx, &format!("Copied: {copied}"));

    if partition.encoded.is_empty() {
        return Ok(summary);
    }

    Console::phase(ctx, 4, "Decoding missing encoded files...");
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

    let mut ledger = Ledger::load(&cfg.paths.ledger_file);
    let files: Vec<&FileRecord> = partition.encoded.iter().collect();
    summary.tally = decode_all(&mut decoder, &files, &mut ledger, cfg, ctx);
    Ok(summary)
}

fn list(ctx: &AppContext, label: &str, files: &[FileRecord]) {
    for f in files {
        Console::line(ctx, &format!("[{label}] {}", f.key()));
    }
}

fn print_summary(summary: &RepairSummary, ctx: &AppContext) {
    if ctx.quiet || summary.missing == 0 {
        return;
    }
    println!();
    Console::rule(ctx);
    println!("{}", Paint::heading(ctx, "Repair complete"));
    Console::line(ctx, &format!("Plain files copied: {}", summary.plain_copied));
    Console::line(
        ctx,
        &Paint::ok(ctx, &format!("Encoded files decoded: {}", summary.tally.decoded)),
    );
    if summary.tally.failed > 0 || summary.copy_failures > 0 {
        Console::line(
            ctx,
            &Paint::err(
                ctx,
                &format!("Failed: {}", summary.tally.failed + summary.copy_failures),
            ),
        );
    }
    Console::rule(ctx);
}
