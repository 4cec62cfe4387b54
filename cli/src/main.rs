//! Prospector: find out which tools an MCP server exposes.
//!
//! Two subcommands:
//! - `prospector discover`: discover tools for a template, an image, or a running URL
//! - `prospector cache`: clear or invalidate cached discovery results

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use nimbus_prospector::model::{DEFAULT_HTTP_PORT, ImageSubject};
use nimbus_prospector::{
    DiscoveryOptions, DiscoveryResult, Fingerprint, ProspectorConfig, Subject, SubjectClass,
    ToolDiscovery,
};
use tracing_subscriber::EnvFilter;

/// Prospector: MCP tool discovery engine.
#[derive(Parser)]
#[command(
    name = "prospector",
    version,
    about = "Prospector: discover the tools an MCP server exposes"
)]
struct Cli {
    /// Path to prospector.toml [default: ./prospector.toml or ~/.config/prospector/prospector.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover the tools a subject exposes and print them as JSON
    Discover {
        #[command(subcommand)]
        subject: SubjectCommand,
    },
    /// Maintain the discovery cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand)]
enum SubjectCommand {
    /// A template from the templates directory
    Template {
        id: String,
        /// Template configuration value (repeatable)
        #[arg(
            short = 'C',
            long = "config-value",
            value_name = "KEY=VALUE",
            value_parser = parse_key_value
        )]
        values: Vec<(String, String)>,
        #[command(flatten)]
        options: RunOptions,
    },
    /// A bare container image
    Image {
        image: String,
        /// Container port the server listens on over HTTP
        #[arg(long, default_value_t = DEFAULT_HTTP_PORT)]
        port: u16,
        /// Container environment variable (repeatable)
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        env: Vec<(String, String)>,
        #[command(flatten)]
        options: RunOptions,
        /// Arguments passed to the image
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// A running Streamable HTTP server
    Url {
        url: String,
        #[command(flatten)]
        options: RunOptions,
    },
}

#[derive(Args)]
struct RunOptions {
    /// Ignore any cached result; the new result is still cached
    #[arg(long)]
    refresh: bool,
    /// Neither read nor write the cache
    #[arg(long)]
    no_cache: bool,
    /// Per-strategy timeout in seconds [default: from config]
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Remove cached results, optionally only for one subject class
    Clear {
        #[arg(long, value_enum)]
        class: Option<ClassArg>,
    },
    /// Remove one cached result by fingerprint
    Invalidate { fingerprint: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ClassArg {
    Template,
    Image,
    Live,
}

impl From<ClassArg> for SubjectClass {
    fn from(value: ClassArg) -> Self {
        match value {
            ClassArg::Template => SubjectClass::Template,
            ClassArg::Image => SubjectClass::Image,
            ClassArg::Live => SubjectClass::Live,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity; stdout carries only JSON
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(resolve_config(cli.config)).await?;
    let discovery = ToolDiscovery::from_config(&config);

    match cli.command {
        Commands::Discover { subject } => {
            let (subject, options) = build_subject(subject, &config);
            let result = discovery.discover(&subject, &options).await?;
            report(&result)?;
        }
        Commands::Cache { action } => run_cache(&discovery, action).await?,
    }

    Ok(())
}

fn build_subject(
    command: SubjectCommand,
    config: &ProspectorConfig,
) -> (Subject, DiscoveryOptions) {
    match command {
        SubjectCommand::Template {
            id,
            values,
            options,
        } => (
            Subject::template(id, values.into_iter().collect()),
            discovery_options(&options, config),
        ),
        SubjectCommand::Image {
            image,
            port,
            env,
            options,
            args,
        } => (
            Subject::Image(ImageSubject {
                image,
                args,
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
                port,
            }),
            discovery_options(&options, config),
        ),
        SubjectCommand::Url { url, options } => {
            (Subject::http(url), discovery_options(&options, config))
        }
    }
}

fn discovery_options(options: &RunOptions, config: &ProspectorConfig) -> DiscoveryOptions {
    let timeout = options
        .timeout
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.discovery.timeout_per_strategy());
    DiscoveryOptions {
        force_refresh: options.refresh,
        no_cache: options.no_cache,
        timeout_per_strategy: timeout,
        config_overrides: BTreeMap::new(),
    }
}

/// Print the result to stdout; note fallback strategies on stderr.
fn report(result: &DiscoveryResult) -> Result<()> {
    if result.is_fallback() {
        tracing::warn!(
            strategy = %result.strategy_used,
            failures = result.failures.len(),
            "tools came from a fallback strategy"
        );
        for failure in &result.failures {
            eprintln!("  {}", failure);
        }
    }
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

async fn run_cache(discovery: &ToolDiscovery, action: CacheCommand) -> Result<()> {
    let cache = discovery.cache();
    match action {
        CacheCommand::Clear { class: Some(class) } => {
            let class = SubjectClass::from(class);
            let removed = cache.clear_class(class).await?;
            eprintln!("removed {} {} cache entries", removed, class);
        }
        CacheCommand::Clear { class: None } => {
            let removed = cache.clear_all().await?;
            eprintln!("removed {} cache entries", removed);
        }
        CacheCommand::Invalidate { fingerprint } => {
            let key = Fingerprint::parse(&fingerprint)?;
            if cache.invalidate(&key).await? {
                eprintln!("removed {}", key);
            } else {
                eprintln!("no cache entry for {}", key);
            }
        }
    }
    Ok(())
}

/// `KEY=VALUE` → `(KEY, VALUE)`. The value may itself contain `=`.
fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Resolve config file path: explicit flag → ./prospector.toml →
/// ~/.config/prospector/prospector.toml. `None` means built-in defaults.
fn resolve_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }

    let local = Path::new("prospector.toml");
    if local.exists() {
        return Some(local.to_path_buf());
    }

    dirs::config_dir()
        .map(|dir| dir.join("prospector").join("prospector.toml"))
        .filter(|path| path.exists())
}

/// Load and validate a prospector.toml, or fall back to defaults.
async fn load_config(path: Option<PathBuf>) -> Result<ProspectorConfig> {
    match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            Ok(ProspectorConfig::load(&path).await?)
        }
        None => {
            tracing::debug!("no prospector.toml found, using defaults");
            Ok(ProspectorConfig::default())
        }
    }
}
