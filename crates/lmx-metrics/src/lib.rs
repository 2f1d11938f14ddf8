//! # lmx-metrics
//!
//! Prometheus metrics for lmx.
//!
//! Metrics are grouped by concern in [`common`] and owned by a shared
//! [`MetricsRegistry`] that renders the text exposition format for the
//! admin metrics route. Gauges describing live state (in-flight requests,
//! memory, loaded models) are refreshed by the caller right before export.

pub mod common;
pub mod registry;

pub use common::{AdmissionMetrics, LifecycleMetrics, LmxMetrics, ResourceMetrics};
pub use registry::{MetricsRegistry, MetricsRegistryBuilder};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
