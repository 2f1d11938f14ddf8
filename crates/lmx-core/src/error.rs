//! Error handling for lmx
//!
//! Provides a unified error type and result type for use across all lmx components.
//! The admission-related variants (`Busy`, `RateLimited`, `Shed`) carry a retry hint
//! so the HTTP boundary can emit a `Retry-After` header without extra bookkeeping.

/// Result type alias for lmx operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for lmx
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No concurrency slot became free within the acquisition timeout
    #[error("Server busy: no inference slot available within {waited_ms}ms")]
    Busy { waited_ms: u64, retry_after_secs: u64 },

    /// Per-client request budget exhausted
    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Rejected by the load-shedding gate under memory pressure
    #[error("Memory pressure critical ({usage_percent:.1}%), request shed")]
    Shed { usage_percent: f64, retry_after_secs: u64 },

    /// Missing or invalid admin credentials
    #[error("Invalid or missing admin key")]
    Unauthorized,

    /// A model failed to reload during crash recovery
    #[error("Failed to recover model {model_id}: {reason}")]
    RecoveryFailure { model_id: String, reason: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Invalid request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Resource temporarily unavailable
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Inference runtime errors
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Accelerator telemetry or control errors
    #[error("Accelerator error: {0}")]
    Accelerator(String),

    /// Persisted state errors
    #[error("State error: {0}")]
    State(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a busy error for an acquisition that waited `waited_ms`
    pub fn busy(waited_ms: u64, retry_after_secs: u64) -> Self {
        Self::Busy {
            waited_ms,
            retry_after_secs,
        }
    }

    /// Create a rate limited error
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::RateLimited { retry_after_secs }
    }

    /// Create a load-shedding error
    pub fn shed(usage_percent: f64, retry_after_secs: u64) -> Self {
        Self::Shed {
            usage_percent,
            retry_after_secs,
        }
    }

    /// Create a recovery failure
    pub fn recovery_failure(model_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RecoveryFailure {
            model_id: model_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create an accelerator error
    pub fn accelerator(msg: impl Into<String>) -> Self {
        Self::Accelerator(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable by the client
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Busy { .. }
                | Error::RateLimited { .. }
                | Error::Shed { .. }
                | Error::Unavailable(_)
                | Error::Timeout(_)
        )
    }

    /// Seconds the client should wait before retrying, if any
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Error::Busy {
                retry_after_secs, ..
            }
            | Error::RateLimited { retry_after_secs }
            | Error::Shed {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Machine-readable reason code rendered in error bodies
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::Busy { .. } => "busy",
            Error::RateLimited { .. } => "rate_limited",
            Error::Shed { .. } => "shed",
            Error::Unauthorized => "unauthorized",
            Error::NotFound(_) => "not_found",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Unavailable(_) => "unavailable",
            Error::Timeout(_) => "timeout",
            _ => "internal_error",
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Busy { .. } => "busy",
            Error::RateLimited { .. } => "rate_limited",
            Error::Shed { .. } => "shed",
            Error::Unauthorized => "unauthorized",
            Error::RecoveryFailure { .. } => "recovery_failure",
            Error::InvalidConfiguration(_) => "configuration",
            Error::InvalidRequest(_) => "invalid_request",
            Error::NotFound(_) => "not_found",
            Error::Unavailable(_) => "unavailable",
            Error::Timeout(_) => "timeout",
            Error::Runtime(_) => "runtime",
            Error::Accelerator(_) => "accelerator",
            Error::State(_) => "state",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::InvalidRequest(_) => 400,
            Error::Unauthorized => 403,
            Error::NotFound(_) => 404,
            Error::RateLimited { .. } => 429,
            Error::Busy { .. } | Error::Shed { .. } | Error::Unavailable(_) => 503,
            Error::Timeout(_) => 504,
            Error::Runtime(_) => 502,
            _ => 500,
        }
    }
}
