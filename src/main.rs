use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use unshroud::cli::{AppContext, Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Build a context once, pass everywhere
    let ctx = AppContext {
        quiet: cli.quiet,
        no_color: cli.no_color,
        dry_run: cli.dry_run,
    };

    let default_filter = if ctx.quiet { "unshroud=warn" } else { "unshroud=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(!ctx.no_color)
        .with_target(false)
        .init();

    // `init` must work without a usable config
    let command = match cli.command {
        Commands::Init(args) => return unshroud::infra::config::init(args, &ctx),
        other => other,
    };

    let cfg = unshroud::load_config(cli.config.as_deref())?;
    tracing::debug!(?cfg, "configuration loaded");

    match command {
        Commands::Run(args) => unshroud::batch_run(args, &cfg, &ctx),
        Commands::Repair(args) => unshroud::repair_run(args, &cfg, &ctx),
        Commands::Scan(args) => unshroud::scan_run(args, &cfg, &ctx),
        Commands::Status(args) => unshroud::status_run(args, &cfg, &ctx),
        Commands::Init(_) => Ok(()),
    }
}
