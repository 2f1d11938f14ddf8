//! Liveness, readiness and deep health reporting
//!
//! Liveness and readiness are cheap and never look at memory or helpers.
//! The deep snapshot aggregates every component and is the only report
//! that can be `degraded`. Nothing here mutates the state it reads.

use crate::admission::AdmissionController;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use lmx_core::{
    AcceleratorStats, Accelerator, HealthConfig, HelperProbe, HelperStatus, InferenceRuntime,
    MemoryMonitor,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Startup facts published by the lifecycle manager
#[derive(Debug, Default)]
pub struct LifecycleStatus {
    safe_mode: AtomicBool,
    startup_count: AtomicU64,
}

impl LifecycleStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, safe_mode: bool, startup_count: u64) {
        self.safe_mode.store(safe_mode, Ordering::Release);
        self.startup_count.store(startup_count, Ordering::Release);
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Acquire)
    }

    pub fn startup_count(&self) -> u64 {
        self.startup_count.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    pub status: &'static str,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub status: &'static str,
    pub models_loaded: usize,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.models_loaded > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub usage_percent: Option<f64>,
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub available_bytes: Option<u64>,
    pub warning_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceleratorReport {
    pub name: String,
    #[serde(flatten)]
    pub stats: AcceleratorStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionReport {
    pub capacity: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub available_slots: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsReport {
    pub loaded: Vec<String>,
    pub count: usize,
}

/// Full diagnostic snapshot, recomputed per request
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    /// Why the status is degraded, empty when ok
    pub reasons: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub memory: MemoryReport,
    pub accelerator: AcceleratorReport,
    pub helpers: Vec<HelperStatus>,
    pub models: ModelsReport,
    pub admission: AdmissionReport,
    pub safe_mode: bool,
    pub startup_count: u64,
}

/// Aggregates live component state into health reports
pub struct HealthReporter {
    memory: Arc<dyn MemoryMonitor>,
    accelerator: Arc<dyn Accelerator>,
    runtime: Arc<dyn InferenceRuntime>,
    helpers: Vec<Arc<dyn HelperProbe>>,
    admission: Arc<AdmissionController>,
    lifecycle: Arc<LifecycleStatus>,
    memory_warning_percent: f64,
    helper_timeout: Duration,
    started_at: Instant,
}

impl HealthReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &HealthConfig,
        memory: Arc<dyn MemoryMonitor>,
        accelerator: Arc<dyn Accelerator>,
        runtime: Arc<dyn InferenceRuntime>,
        helpers: Vec<Arc<dyn HelperProbe>>,
        admission: Arc<AdmissionController>,
        lifecycle: Arc<LifecycleStatus>,
    ) -> Self {
        Self {
            memory,
            accelerator,
            runtime,
            helpers,
            admission,
            lifecycle,
            memory_warning_percent: config.memory_warning_percent,
            helper_timeout: config.helper_timeout(),
            started_at: Instant::now(),
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleStatus> {
        &self.lifecycle
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn liveness(&self) -> Liveness {
        Liveness {
            status: "alive",
            uptime_seconds: self.uptime().as_secs(),
        }
    }

    /// Ready when at least one model is loaded, read live from the runtime
    pub async fn readiness(&self) -> Readiness {
        let models_loaded = self.runtime.loaded_models().await.len();
        Readiness {
            status: if models_loaded > 0 { "ready" } else { "unavailable" },
            models_loaded,
        }
    }

    pub fn memory_report(&self) -> MemoryReport {
        match self.memory.host_memory() {
            Ok(memory) => MemoryReport {
                usage_percent: Some(memory.usage_percent()),
                total_bytes: Some(memory.total_bytes),
                used_bytes: Some(memory.used_bytes),
                available_bytes: Some(memory.available_bytes),
                warning_percent: self.memory_warning_percent,
                error: None,
            },
            Err(e) => MemoryReport {
                usage_percent: None,
                total_bytes: None,
                used_bytes: None,
                available_bytes: None,
                warning_percent: self.memory_warning_percent,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn accelerator_report(&self) -> AcceleratorReport {
        let name = self.accelerator.name().to_string();
        match self.accelerator.stats() {
            Ok(stats) => AcceleratorReport {
                name,
                stats,
                error: None,
            },
            Err(e) => AcceleratorReport {
                name,
                stats: AcceleratorStats::unavailable(),
                error: Some(e.to_string()),
            },
        }
    }

    pub fn admission_report(&self) -> AdmissionReport {
        AdmissionReport {
            capacity: self.admission.capacity(),
            in_flight: self.admission.in_flight(),
            waiting: self.admission.waiting(),
            available_slots: self.admission.available_slots(),
        }
    }

    /// Probe every helper concurrently, each bounded by the helper timeout
    pub async fn probe_helpers(&self) -> Vec<HelperStatus> {
        let timeout = self.helper_timeout;
        let probes = self.helpers.iter().map(|helper| async move {
            let status = match tokio::time::timeout(timeout, helper.probe()).await {
                Ok(status) => status,
                Err(_) => HelperStatus::unhealthy(
                    helper.name(),
                    format!("probe timed out after {}ms", timeout.as_millis()),
                ),
            };
            if !status.healthy {
                warn!(
                    helper = %status.name,
                    error = status.error.as_deref().unwrap_or("unknown"),
                    "Helper service unhealthy"
                );
            }
            status
        });
        join_all(probes).await
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let memory = self.memory_report();
        let accelerator = self.accelerator_report();
        let (helpers, loaded) = tokio::join!(self.probe_helpers(), self.runtime.loaded_models());

        let mut reasons = Vec::new();
        match memory.usage_percent {
            Some(usage) if usage > self.memory_warning_percent => reasons.push(format!(
                "memory usage {:.1}% above warning threshold {:.1}%",
                usage, self.memory_warning_percent
            )),
            Some(_) => {}
            None => reasons.push("memory usage unavailable".to_string()),
        }
        for helper in helpers.iter().filter(|h| !h.healthy) {
            reasons.push(format!("helper {} unhealthy", helper.name));
        }

        let status = if reasons.is_empty() {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };

        HealthSnapshot {
            status,
            reasons,
            timestamp: Utc::now(),
            uptime_seconds: self.uptime().as_secs(),
            memory,
            accelerator,
            helpers,
            models: ModelsReport {
                count: loaded.len(),
                loaded,
            },
            admission: self.admission_report(),
            safe_mode: self.lifecycle.safe_mode(),
            startup_count: self.lifecycle.startup_count(),
        }
    }
}
