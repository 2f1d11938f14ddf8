//! # lmx-agent
//!
//! Top-level lifecycle manager for lmx and the `lmxd` daemon.
//!
//! The [`Agent`] owns every long-lived piece of the server: it records the
//! startup in the runtime state, decides between crash recovery and safe
//! mode, runs the HTTP server and the background tasks, and performs the
//! ordered shutdown that ends with a clean-shutdown record.

pub mod agent;

pub use agent::{Agent, AgentBuilder, ShutdownTrigger, StartupReport};

use lmx_core::config::ObservabilityConfig;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Agent is not running")]
    NotRunning,

    #[error("Agent is already running")]
    AlreadyRunning,

    #[error("Core error: {0}")]
    Core(#[from] lmx_core::Error),

    #[error("State error: {0}")]
    State(#[from] lmx_state::StateError),

    #[error("Server error: {0}")]
    Router(#[from] lmx_router::RouterError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] lmx_metrics::MetricsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.log_format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    result.map_err(|e| AgentError::Config(format!("Failed to initialize logging: {}", e)))
}
