//! Shared metrics registry and text exposition

use crate::common::{advance_counter, LmxMetrics};
use crate::{MetricsError, Result};
use prometheus::{Encoder, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Central registry owning every lmx metric
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsRegistryInner>,
}

#[derive(Debug)]
struct MetricsRegistryInner {
    registry: Registry,
    metrics: LmxMetrics,
}

impl MetricsRegistry {
    /// Registry without global labels
    pub fn new() -> Result<Self> {
        MetricsRegistryBuilder::new().build()
    }

    pub fn metrics(&self) -> &LmxMetrics {
        &self.inner.metrics
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn record_admitted(&self, priority: &str) {
        self.inner
            .metrics
            .admission
            .admitted
            .with_label_values(&[priority])
            .inc();
    }

    /// Count a request rejected for `reason` (busy, shed, rate_limited, unauthorized)
    pub fn record_rejection(&self, reason: &str) {
        self.inner
            .metrics
            .admission
            .rejected
            .with_label_values(&[reason])
            .inc();
    }

    pub fn set_admission(&self, in_flight: usize, waiting: usize, capacity: usize) {
        let admission = &self.inner.metrics.admission;
        admission.in_flight.set(in_flight as i64);
        admission.waiting.set(waiting as i64);
        admission.capacity.set(capacity as i64);
    }

    pub fn set_memory_usage(&self, usage_percent: f64) {
        self.inner.metrics.resources.memory_usage_percent.set(usage_percent);
    }

    pub fn set_accelerator(&self, active_bytes: u64, peak_bytes: u64, cache_bytes: u64) {
        let gauge = &self.inner.metrics.resources.accelerator_bytes;
        gauge.with_label_values(&["active"]).set(active_bytes as i64);
        gauge.with_label_values(&["peak"]).set(peak_bytes as i64);
        gauge.with_label_values(&["cache"]).set(cache_bytes as i64);
    }

    /// Bring the reclaim counters up to the reclaimer's running totals
    pub fn set_cache_reclaims(&self, reclaims: u64, bytes_freed: u64) {
        let resources = &self.inner.metrics.resources;
        advance_counter(&resources.cache_reclaims, reclaims);
        advance_counter(&resources.cache_bytes_freed, bytes_freed);
    }

    pub fn set_loaded_models(&self, count: usize) {
        self.inner.metrics.lifecycle.loaded_models.set(count as i64);
    }

    pub fn set_lifecycle(&self, safe_mode: bool, startup_count: u64) {
        let lifecycle = &self.inner.metrics.lifecycle;
        lifecycle.safe_mode.set(i64::from(safe_mode));
        lifecycle.startup_count.set(startup_count as i64);
    }

    pub fn set_helper_up(&self, helper: &str, up: bool) {
        self.inner
            .metrics
            .lifecycle
            .helper_up
            .with_label_values(&[helper])
            .set(i64::from(up));
    }

    /// Render all metrics in the Prometheus text format
    pub fn export_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Export(format!("Failed to encode metrics: {}", e)))?;

        debug!(families = metric_families.len(), "Exported metrics");

        String::from_utf8(buffer)
            .map_err(|e| MetricsError::Export(format!("Metrics are not valid UTF-8: {}", e)))
    }
}

/// Builder for [`MetricsRegistry`]
#[derive(Debug, Default)]
pub struct MetricsRegistryBuilder {
    global_labels: HashMap<String, String>,
}

impl MetricsRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label attached to every exported series
    pub fn with_global_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.global_labels.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<MetricsRegistry> {
        let labels = if self.global_labels.is_empty() {
            None
        } else {
            Some(self.global_labels)
        };
        let registry = Registry::new_custom(None, labels)?;

        let metrics = LmxMetrics::new()
            .map_err(|e| MetricsError::Registry(format!("Failed to create metrics: {}", e)))?;
        metrics
            .register(&registry)
            .map_err(|e| MetricsError::Registry(format!("Failed to register metrics: {}", e)))?;

        Ok(MetricsRegistry {
            inner: Arc::new(MetricsRegistryInner { registry, metrics }),
        })
    }
}
