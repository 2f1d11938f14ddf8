//! # lmx-router
//!
//! The HTTP request path of lmx: admission control, load shedding, rate
//! limiting, admin authentication and health reporting in front of the
//! inference runtime.
//!
//! This crate provides:
//! - [`AdmissionController`], the bounded-concurrency gate with scoped permits
//! - [`LoadShedder`], the per-request memory breaker
//! - [`RateLimiter`], per-client token buckets per route group
//! - [`HealthReporter`] for liveness, readiness and deep health
//! - [`ModelManager`], model load/unload with durable state
//! - [`HttpServer`], the axum server wiring it all together
//!
//! ## Example
//!
//! ```rust,no_run
//! use lmx_router::{AppState, Collaborators, HttpServer};
//!
//! async fn run(config: lmx_core::Config, collaborators: Collaborators) -> lmx_router::Result<()> {
//!     let metrics = lmx_metrics::MetricsRegistry::new().expect("metrics");
//!     let state = AppState::new(&config, collaborators, metrics);
//!     HttpServer::new(&config.server, state)
//!         .serve(async { let _ = tokio::signal::ctrl_c().await; })
//!         .await
//! }
//! ```

use thiserror::Error;

pub mod admission;
pub mod auth;
pub mod error;
pub mod handler;
pub mod health;
pub mod models;
pub mod rate_limit;
pub mod server;
pub mod shedding;

pub use admission::{AdmissionController, AdmissionPermit};
pub use auth::AdminAuth;
pub use error::ApiError;
pub use health::{HealthReporter, HealthSnapshot, HealthStatus, LifecycleStatus};
pub use models::{ModelManager, RecoveryReport};
pub use rate_limit::{RateLimiter, RouteGroup, TokenBucket};
pub use server::{create_router, AppState, Collaborators, HttpServer};
pub use shedding::{LoadShedder, ShedDecision};

pub const LIVENESS_PATH: &str = "/healthz";
pub const READINESS_PATH: &str = "/readyz";

/// Probe paths bypass shedding and rate limiting
pub fn is_probe_path(path: &str) -> bool {
    path == LIVENESS_PATH || path == READINESS_PATH
}

/// Result type for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors that can occur while running the HTTP server
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RouterError> for lmx_core::Error {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Configuration(msg) => lmx_core::Error::config(msg),
            RouterError::Server(msg) => lmx_core::Error::internal(msg),
            RouterError::Io(e) => lmx_core::Error::Io(e),
        }
    }
}
