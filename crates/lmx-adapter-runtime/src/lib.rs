//! # lmx-adapter-runtime
//!
//! Adapters for the collaborators that sit behind the admission layer.
//!
//! This crate provides:
//! - [`HttpRuntime`], an [`InferenceRuntime`] that forwards generation
//!   requests to an OpenAI-compatible upstream server
//! - [`HttpHelperProbe`], a timed health probe for helper services
//! - Mock runtime and helper probes for tests (`mock` feature)
//!
//! ## Example
//!
//! ```rust,no_run
//! use lmx_adapter_runtime::build_runtime;
//! use lmx_core::config::RuntimeConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = build_runtime(&RuntimeConfig::default())?;
//!     runtime.load_model("qwen2.5-7b").await?;
//!     println!("loaded: {:?}", runtime.loaded_models().await);
//!     Ok(())
//! }
//! ```

use lmx_core::config::{HelperConfig, RuntimeConfig};
use lmx_core::{HelperProbe, InferenceRuntime};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod helpers;
pub mod http;

#[cfg(any(feature = "mock", test))]
pub mod mock;

pub use helpers::HttpHelperProbe;
pub use http::HttpRuntime;

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised by runtime adapters
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Model not available upstream: {0}")]
    ModelUnavailable(String),

    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RuntimeError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Connection(_) | RuntimeError::Timeout(_)
        ) || matches!(self, RuntimeError::Upstream { status, .. } if *status >= 500)
    }

    pub(crate) fn from_reqwest(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RuntimeError::Timeout(format!("{}: {}", context, err))
        } else if err.is_decode() {
            RuntimeError::InvalidResponse(format!("{}: {}", context, err))
        } else {
            RuntimeError::Connection(format!("{}: {}", context, err))
        }
    }
}

impl From<RuntimeError> for lmx_core::Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Configuration(msg) => lmx_core::Error::config(msg),
            RuntimeError::ModelNotLoaded(model) => {
                lmx_core::Error::not_found(format!("model {} is not loaded", model))
            }
            RuntimeError::ModelUnavailable(model) => {
                lmx_core::Error::not_found(format!("model {} is not available", model))
            }
            RuntimeError::Timeout(msg) => lmx_core::Error::timeout(msg),
            other => lmx_core::Error::runtime(other.to_string()),
        }
    }
}

/// Build the inference runtime selected by configuration
pub fn build_runtime(config: &RuntimeConfig) -> lmx_core::Result<Arc<dyn InferenceRuntime>> {
    match config.kind.as_str() {
        "http" => Ok(Arc::new(HttpRuntime::new(config)?)),
        #[cfg(any(feature = "mock", test))]
        "mock" => Ok(Arc::new(mock::MockRuntime::new())),
        other => Err(lmx_core::Error::config(format!(
            "Runtime kind {} is not available in this build",
            other
        ))),
    }
}

/// Build helper probes for every configured helper service
pub fn build_helper_probes(
    helpers: &[HelperConfig],
    timeout: Duration,
) -> lmx_core::Result<Vec<Arc<dyn HelperProbe>>> {
    helpers
        .iter()
        .map(|h| {
            HttpHelperProbe::new(&h.name, &h.url, timeout)
                .map(|p| Arc::new(p) as Arc<dyn HelperProbe>)
                .map_err(Into::into)
        })
        .collect()
}
