use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::{AppContext, InitArgs, PathOverrides, RepairArgs, RunArgs};

/// Config files probed (in order) when no explicit `--config` is given
const CONFIG_PATHS: [&str; 4] = ["unshroud.toml", "unshroud.yaml", "unshroud.json", ".unshroud.toml"];

/// Immutable run configuration, built once in `main` and passed by reference
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config
{
    /// Trees, scratch space and persisted documents
    pub paths: PathsConfig,

    /// Remote decoding service endpoints and credentials
    pub remote: RemoteConfig,

    /// Retry, delay and timeout tuning
    pub tuning: TuningConfig,

    /// Extra glob patterns pruned from the source walk
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig
{
    pub source_dir: PathBuf,
    pub dest_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub ledger_file: PathBuf,
    pub report_file: PathBuf,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig
{
    pub login_url: String,
    pub decoder_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig
{
    /// Attempts per encoded file (minimum 1)
    pub max_retries: u32,
    pub delay_between_files_ms: u64,
    pub retry_backoff_ms: u64,
    pub page_timeout_secs: u64,
    pub login_timeout_secs: u64,
    pub results_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for PathsConfig
{
    fn default() -> Self
    {
        Self {
            source_dir: PathBuf::from("code"),
            dest_dir: PathBuf::from("source"),
            staging_dir: PathBuf::from(".unshroud/staging"),
            ledger_file: PathBuf::from(".unshroud/decode_progress.json"),
            report_file: PathBuf::from(".unshroud/missing_files_report.json"),
        }
    }
}

impl Default for TuningConfig
{
    fn default() -> Self
    {
        Self {
            max_retries: 3,
            delay_between_files_ms: 2000,
            retry_backoff_ms: 1000,
            page_timeout_secs: 30,
            login_timeout_secs: 60,
            results_timeout_secs: 120,
            download_timeout_secs: 60,
            poll_interval_ms: 2000,
        }
    }
}

impl fmt::Debug for RemoteConfig
{
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result
    {
        f.debug_struct("RemoteConfig")
            .field("login_url", &self.login_url)
            .field("decoder_url", &self.decoder_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl RemoteConfig
{
    /// Names of required remote settings that are still empty
    pub fn missing_fields(&self) -> Vec<&'static str>
    {
        let mut missing = Vec::new();
        for (name, value) in [
            ("remote.login_url", &self.login_url),
            ("remote.decoder_url", &self.decoder_url),
            ("remote.username", &self.username),
            ("remote.password", &self.password),
        ]
        {
            if value
                .trim()
                .is_empty()
            {
                missing.push(name);
            }
        }
        missing
    }
}

impl TuningConfig
{
    pub fn attempts(&self) -> u32
    {
        self.max_retries
            .max(1)
    }

    pub fn delay_between_files(&self) -> Duration
    {
        Duration::from_millis(self.delay_between_files_ms)
    }

    pub fn retry_backoff(&self) -> Duration
    {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn page_timeout(&self) -> Duration
    {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration
    {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn results_timeout(&self) -> Duration
    {
        Duration::from_secs(self.results_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration
    {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration
    {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config
{
    /// Apply `--source`/`--dest` overrides
    pub fn with_paths(
        mut self,
        overrides: &PathOverrides,
    ) -> Self
    {
        if let Some(p) = &overrides.source
        {
            self.paths
                .source_dir = p.clone();
        }
        if let Some(p) = &overrides.dest
        {
            self.paths
                .dest_dir = p.clone();
        }
        self
    }

    /// Apply every per-run override of the `run` command
    pub fn with_run_args(
        self,
        args: &RunArgs,
    ) -> Self
    {
        let mut cfg = self.with_paths(&args.paths);
        if let Some(p) = &args.staging
        {
            cfg.paths
                .staging_dir = p.clone();
        }
        if let Some(p) = &args.ledger
        {
            cfg.paths
                .ledger_file = p.clone();
        }
        if let Some(ms) = args.delay_ms
        {
            cfg.tuning
                .delay_between_files_ms = ms;
        }
        if let Some(n) = args.max_retries
        {
            cfg.tuning
                .max_retries = n;
        }
        cfg
    }

    /// Apply the overrides of the `repair` command
    pub fn with_repair_args(
        self,
        args: &RepairArgs,
    ) -> Self
    {
        let mut cfg = self.with_paths(&args.paths);
        if let Some(p) = &args.report
        {
            cfg.paths
                .report_file = p.clone();
        }
        cfg
    }

    /// Source must be an existing directory distinct from the destination
    pub fn validate_trees(&self) -> Result<()>
    {
        let source = &self
            .paths
            .source_dir;
        if !source.is_dir()
        {
            anyhow::bail!("Source directory does not exist: {}", source.display());
        }

        let dest = &self
            .paths
            .dest_dir;
        let same = match (dunce::canonicalize(source), dunce::canonicalize(dest))
        {
            (Ok(a), Ok(b)) => a == b,
            _ => source == dest,
        };
        if same
        {
            anyhow::bail!(
                "Source and destination must differ (both are {})",
                source.display()
            );
        }

        if self
            .tuning
            .max_retries
            == 0
        {
            anyhow::bail!("tuning.max_retries must be at least 1");
        }
        Ok(())
    }

    /// Expand `~` and `$VAR` in every configured path
    fn expand_paths(mut self) -> Result<Self>
    {
        let p = &mut self.paths;
        for path in [
            &mut p.source_dir,
            &mut p.dest_dir,
            &mut p.staging_dir,
            &mut p.ledger_file,
            &mut p.report_file,
        ]
        {
            *path = expand_path(path)?;
        }
        Ok(self)
    }
}

fn expand_path(path: &Path) -> Result<PathBuf>
{
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path {}", path.display()))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Load layered configuration: defaults, config file, then `UNSHROUD_*` env vars.
///
/// Nested keys use a double underscore, e.g. `UNSHROUD_REMOTE__PASSWORD`.
pub fn load_config(explicit: Option<&Path>) -> Result<Config>
{
    let mut builder = config::Config::builder();

    match explicit
    {
        Some(path) =>
        {
            if !path.exists()
            {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            builder = builder.add_source(config::File::from(path));
        }
        None =>
        {
            for path in &CONFIG_PATHS
            {
                if Path::new(path).exists()
                {
                    builder = builder.add_source(config::File::with_name(path));
                    break;
                }
            }
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("UNSHROUD")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let cfg = builder
        .build()
        .context("Failed to load configuration")?;
    let parsed: Config = cfg
        .try_deserialize()
        .context("Failed to parse configuration")?;

    parsed.expand_paths()
}

pub fn init(
    args: InitArgs,
    ctx: &AppContext,
) -> Result<()>
{
    let config_path = args
        .path
        .join("unshroud.toml");

    if config_path.exists() && !args.force
    {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    if ctx.dry_run
    {
        if !ctx.quiet
        {
            println!("Would write {}:\n{toml_string}", config_path.display());
        }
        return Ok(());
    }

    std::fs::write(&config_path, toml_string).context("Failed to write config file")?;

    if !ctx.quiet
    {
        println!("Created config file at {}", config_path.display());
    }
    Ok(())
}
