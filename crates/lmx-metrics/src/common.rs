//! Metric definitions for lmx components

use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts};

/// Admission controller and request-gate metrics
#[derive(Debug, Clone)]
pub struct AdmissionMetrics {
    /// Requests currently holding a concurrency slot (high priority included)
    pub in_flight: IntGauge,

    /// Normal-priority requests waiting for a slot
    pub waiting: IntGauge,

    /// Fixed capacity of the concurrency gate
    pub capacity: IntGauge,

    /// Requests admitted, by priority
    pub admitted: IntCounterVec,

    /// Requests rejected before reaching the runtime, by reason
    pub rejected: IntCounterVec,
}

impl AdmissionMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            in_flight: IntGauge::with_opts(Opts::new(
                "lmx_admission_in_flight_requests",
                "Requests currently holding an inference slot",
            ))?,
            waiting: IntGauge::with_opts(Opts::new(
                "lmx_admission_waiting_requests",
                "Requests queued for an inference slot",
            ))?,
            capacity: IntGauge::with_opts(Opts::new(
                "lmx_admission_capacity",
                "Maximum concurrent normal-priority requests",
            ))?,
            admitted: IntCounterVec::new(
                Opts::new("lmx_requests_admitted_total", "Requests admitted to the runtime"),
                &["priority"],
            )?,
            rejected: IntCounterVec::new(
                Opts::new("lmx_requests_rejected_total", "Requests rejected by admission, shedding, rate limiting or auth"),
                &["reason"],
            )?,
        })
    }

    /// Register all metrics with the given registry
    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.in_flight.clone()))?;
        registry.register(Box::new(self.waiting.clone()))?;
        registry.register(Box::new(self.capacity.clone()))?;
        registry.register(Box::new(self.admitted.clone()))?;
        registry.register(Box::new(self.rejected.clone()))?;
        Ok(())
    }
}

/// Host memory and accelerator metrics
#[derive(Debug, Clone)]
pub struct ResourceMetrics {
    pub memory_usage_percent: Gauge,

    /// Accelerator allocator bytes by kind (active, peak, cache)
    pub accelerator_bytes: IntGaugeVec,

    pub cache_reclaims: IntCounter,

    pub cache_bytes_freed: IntCounter,
}

impl ResourceMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            memory_usage_percent: Gauge::with_opts(Opts::new(
                "lmx_memory_usage_percent",
                "Host memory usage percentage",
            ))?,
            accelerator_bytes: IntGaugeVec::new(
                Opts::new("lmx_accelerator_memory_bytes", "Accelerator allocator memory by kind"),
                &["kind"],
            )?,
            cache_reclaims: IntCounter::with_opts(Opts::new(
                "lmx_cache_reclaims_total",
                "Accelerator cache reclaim passes that cleared the cache",
            ))?,
            cache_bytes_freed: IntCounter::with_opts(Opts::new(
                "lmx_cache_bytes_freed_total",
                "Bytes released by accelerator cache reclaims",
            ))?,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.memory_usage_percent.clone()))?;
        registry.register(Box::new(self.accelerator_bytes.clone()))?;
        registry.register(Box::new(self.cache_reclaims.clone()))?;
        registry.register(Box::new(self.cache_bytes_freed.clone()))?;
        Ok(())
    }
}

/// Process lifecycle metrics
#[derive(Debug, Clone)]
pub struct LifecycleMetrics {
    pub loaded_models: IntGauge,

    /// 1 while crash-loop safe mode is active
    pub safe_mode: IntGauge,

    pub startup_count: IntGauge,

    /// 1 when a helper service answered its last probe
    pub helper_up: IntGaugeVec,
}

impl LifecycleMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            loaded_models: IntGauge::with_opts(Opts::new("lmx_loaded_models", "Models currently loaded"))?,
            safe_mode: IntGauge::with_opts(Opts::new(
                "lmx_safe_mode",
                "Crash-loop safe mode (1 = active)",
            ))?,
            startup_count: IntGauge::with_opts(Opts::new(
                "lmx_startup_count",
                "Lifetime process startups recorded in runtime state",
            ))?,
            helper_up: IntGaugeVec::new(
                Opts::new("lmx_helper_up", "Helper service reachability (1 = healthy)"),
                &["helper"],
            )?,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.loaded_models.clone()))?;
        registry.register(Box::new(self.safe_mode.clone()))?;
        registry.register(Box::new(self.startup_count.clone()))?;
        registry.register(Box::new(self.helper_up.clone()))?;
        Ok(())
    }
}

/// All lmx metrics
#[derive(Debug, Clone)]
pub struct LmxMetrics {
    pub admission: AdmissionMetrics,
    pub resources: ResourceMetrics,
    pub lifecycle: LifecycleMetrics,
}

impl LmxMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            admission: AdmissionMetrics::new()?,
            resources: ResourceMetrics::new()?,
            lifecycle: LifecycleMetrics::new()?,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        self.admission.register(registry)?;
        self.resources.register(registry)?;
        self.lifecycle.register(registry)?;
        Ok(())
    }
}

/// Advance a monotonic counter to `total`, ignoring totals behind the counter
pub fn advance_counter(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}
