//! Main binary for the lmx server daemon (lmxd)

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use lmx_agent::{init_logging, AgentBuilder};
use lmx_core::config::CONFIG_ENV_VAR;
use lmx_core::Config;
use lmx_state::{CrashLoopDetector, RuntimeStateStore};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "lmxd")]
#[command(about = "Local LLM inference server with admission control")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = CONFIG_ENV_VAR, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Start {
        /// Log level or filter directive
        #[arg(long, value_name = "LEVEL")]
        log_level: Option<String>,

        /// Log output format (text, json)
        #[arg(long, value_name = "FORMAT")]
        log_format: Option<String>,
    },
    /// Print the effective configuration
    Config {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,
    },
    /// Validate the configuration file given with --config
    Validate,
    /// Show the persisted runtime state and the crash-loop verdict
    State {
        /// State file, defaults to the configured path
        #[arg(long, value_name = "FILE")]
        path: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start {
            log_level,
            log_format,
        }) => start_server(cli.config, log_level, log_format).await,
        Some(Commands::Config { format }) => print_config(cli.config, format),
        Some(Commands::Validate) => validate_config(cli.config),
        Some(Commands::State { path }) => show_state(cli.config, path).await,
        None => start_server(cli.config, None, None).await,
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    Ok(config)
}

async fn start_server(
    config_path: Option<PathBuf>,
    log_level: Option<String>,
    log_format: Option<String>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;

    if let Some(level) = log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = log_format {
        config.observability.log_format = format;
    }
    init_logging(&config.observability)?;

    info!(addr = %config.bind_addr(), "Loaded configuration");

    let mut agent = AgentBuilder::new().with_config(config).build()?;
    if let Err(e) = agent.run().await {
        error!(error = %e, "lmxd failed");
        std::process::exit(1);
    }

    Ok(())
}

fn print_config(config_path: Option<PathBuf>, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(&config)?,
        OutputFormat::Json => serde_json::to_string_pretty(&config)?,
    };
    println!("{}", rendered);
    Ok(())
}

fn validate_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let Some(path) = path else {
        anyhow::bail!("validate needs a configuration file, pass --config FILE");
    };
    println!("Validating configuration: {}", path.display());
    let config = load_config(Some(path))?;

    println!("Configuration is valid");
    println!("  Listen address: {}", config.bind_addr());
    println!("  Runtime: {} ({})", config.runtime.kind, config.runtime.endpoint);
    println!(
        "  Admission: {} concurrent, {}ms acquire timeout",
        config.admission.max_concurrent_requests, config.admission.acquire_timeout_ms
    );
    if config.shedding.enabled {
        println!(
            "  Shedding above {}% memory",
            config.shedding.critical_threshold_percent
        );
    }
    if config.rate_limit.enabled {
        println!(
            "  Rate limits: inference {}/min, admin {}/min",
            config.rate_limit.inference.requests_per_minute,
            config.rate_limit.admin.requests_per_minute
        );
    }
    if config.security.admin_key.as_deref().map_or(true, str::is_empty) {
        println!("  Warning: no admin key, administrative routes are open");
    }
    for helper in &config.helpers {
        println!("  Helper: {} ({})", helper.name, helper.url);
    }

    Ok(())
}

async fn show_state(config_path: Option<PathBuf>, path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let path = path.unwrap_or_else(|| config.state.path.clone());
    let store = RuntimeStateStore::new(&path);

    let Some(state) = store.load().await? else {
        println!("No runtime state at {}", path.display());
        return Ok(());
    };

    let verdict = CrashLoopDetector::from_config(&config.state).evaluate(&state, Utc::now());
    let output = serde_json::json!({
        "path": path,
        "state": state,
        "crash_loop": verdict,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
