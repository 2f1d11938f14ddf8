//! Core data types shared across lmx crates

use serde::{Deserialize, Serialize};
use std::fmt;

/// Point-in-time host memory reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostMemory {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

impl HostMemory {
    /// Used memory as a percentage of total, 0.0 when total is unknown
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64) * 100.0
    }

    /// Build a reading from a usage percentage of a given total
    pub fn from_percent(total_bytes: u64, usage_percent: f64) -> Self {
        let used_bytes = (total_bytes as f64 * usage_percent.clamp(0.0, 100.0) / 100.0) as u64;
        Self {
            total_bytes,
            used_bytes,
            available_bytes: total_bytes.saturating_sub(used_bytes),
        }
    }
}

/// Accelerator allocator statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorStats {
    /// False when no accelerator backend is present
    pub available: bool,
    pub active_bytes: u64,
    pub peak_bytes: u64,
    pub cache_bytes: u64,
}

impl AcceleratorStats {
    pub fn unavailable() -> Self {
        Self::default()
    }
}

/// Result of one helper-service health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperStatus {
    pub name: String,
    pub url: Option<String>,
    pub healthy: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

impl HelperStatus {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            url: None,
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: None,
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Admission priority for a generation request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    /// Small internal operations that bypass the concurrency gate
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Opaque generation request forwarded to the inference runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    /// Request path relative to the API root, e.g. `chat/completions`
    pub endpoint: String,
    pub body: serde_json::Value,
    pub request_id: Option<String>,
}

/// Opaque generation response returned by the inference runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub body: serde_json::Value,
}
