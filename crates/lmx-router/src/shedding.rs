//! Load shedding under critical memory pressure

use crate::error::ApiError;
use crate::server::AppState;
use crate::is_probe_path;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use lmx_core::{Error, MemoryMonitor, SheddingConfig};
use std::sync::Arc;
use tracing::warn;

/// Decision for one request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShedDecision {
    Admit,
    Shed { usage_percent: f64 },
}

/// Per-request memory breaker
///
/// Evaluated on every request with no latching or hysteresis. Probe paths
/// never reach it. A failed memory read admits the request.
pub struct LoadShedder {
    monitor: Arc<dyn MemoryMonitor>,
    enabled: bool,
    threshold_percent: f64,
    retry_after_secs: u64,
}

impl LoadShedder {
    pub fn new(monitor: Arc<dyn MemoryMonitor>, config: &SheddingConfig) -> Self {
        Self {
            monitor,
            enabled: config.enabled,
            threshold_percent: config.critical_threshold_percent,
            retry_after_secs: config.retry_after_secs,
        }
    }

    pub fn threshold_percent(&self) -> f64 {
        self.threshold_percent
    }

    pub fn evaluate(&self) -> ShedDecision {
        if !self.enabled {
            return ShedDecision::Admit;
        }

        match self.monitor.host_memory() {
            Ok(memory) => {
                let usage_percent = memory.usage_percent();
                if usage_percent > self.threshold_percent {
                    ShedDecision::Shed { usage_percent }
                } else {
                    ShedDecision::Admit
                }
            }
            Err(e) => {
                warn!(error = %e, "Memory read failed, admitting request without shedding check");
                ShedDecision::Admit
            }
        }
    }

    /// `Ok` to admit, `Err(Shed)` to reject
    pub fn check(&self) -> lmx_core::Result<()> {
        match self.evaluate() {
            ShedDecision::Admit => Ok(()),
            ShedDecision::Shed { usage_percent } => {
                warn!(
                    usage_percent,
                    threshold_percent = self.threshold_percent,
                    "Shedding request under critical memory pressure"
                );
                Err(Error::shed(usage_percent, self.retry_after_secs))
            }
        }
    }
}

/// Middleware rejecting non-probe requests while memory is critical
pub async fn shed_requests(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if is_probe_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    if let Err(e) = state.shedder.check() {
        state.metrics.record_rejection(e.reason_code());
        return Err(e.into());
    }

    Ok(next.run(request).await)
}
