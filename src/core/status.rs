//! `unshroud status`: summarize the ledger.

use anyhow::Result;

use crate::cli::{AppContext, StatusArgs};
use crate::core::ledger::Ledger;
use crate::infra::config::Config;
use crate::infra::utils::{Console, Paint};

pub fn run(args: StatusArgs, cfg: &Config, ctx: &AppContext) -> Result<()> {
    let path = args
        .ledger
        .clone()
        .unwrap_or_else(|| cfg.paths.ledger_file.clone());
    let ledger = Ledger::load(&path);
    let outstanding = ledger.outstanding_failures();

    // Counts print even under --quiet
    println!("Ledger: {}", ledger.path().display());
    println!("{}", Paint::ok(ctx, &format!("Processed: {}", ledger.processed_count())));
    println!(
        "{}",
        Paint::err(ctx, &format!("Failed (not yet processed): {}", outstanding.len()))
    );
    for key in outstanding {
        Console::line(ctx, key);
    }
    Ok(())
}
