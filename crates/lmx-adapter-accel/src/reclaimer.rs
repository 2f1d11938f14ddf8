//! Background reclamation of the accelerator buffer cache

use lmx_core::{Accelerator, ReclaimerConfig};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Periodically clears the accelerator's allocator cache when it exceeds a budget
///
/// Runs on its own task and never inside a request path.
pub struct CacheReclaimer {
    accelerator: Arc<dyn Accelerator>,
    interval: Duration,
    cache_limit_bytes: u64,
    stats: Arc<ReclaimerStats>,
}

/// Counters shared between the reclaimer task and readers
#[derive(Debug, Default)]
pub struct ReclaimerStats {
    runs: AtomicU64,
    reclaims: AtomicU64,
    bytes_freed: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`ReclaimerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReclaimerSnapshot {
    pub runs: u64,
    pub reclaims: u64,
    pub bytes_freed: u64,
    pub errors: u64,
}

impl ReclaimerStats {
    pub fn snapshot(&self) -> ReclaimerSnapshot {
        ReclaimerSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Result of one reclaim pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// No accelerator backend present
    Unavailable,
    UnderBudget { cache_bytes: u64 },
    Reclaimed { before: u64, after: u64, freed: u64 },
    Failed(String),
}

impl CacheReclaimer {
    pub fn new(accelerator: Arc<dyn Accelerator>, config: ReclaimerConfig) -> Self {
        Self {
            accelerator,
            interval: config.interval(),
            cache_limit_bytes: config.cache_limit_bytes,
            stats: Arc::new(ReclaimerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ReclaimerStats> {
        Arc::clone(&self.stats)
    }

    /// Check the cache once and clear it if it is over budget
    pub fn reclaim_once(&self) -> ReclaimOutcome {
        self.stats.runs.fetch_add(1, Ordering::Relaxed);

        let before = match self.accelerator.stats() {
            Ok(stats) if !stats.available => return ReclaimOutcome::Unavailable,
            Ok(stats) => stats.cache_bytes,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(accelerator = self.accelerator.name(), error = %e, "Failed to read accelerator cache size");
                return ReclaimOutcome::Failed(e.to_string());
            }
        };

        if before <= self.cache_limit_bytes {
            debug!(cache_bytes = before, limit_bytes = self.cache_limit_bytes, "Accelerator cache within budget");
            return ReclaimOutcome::UnderBudget { cache_bytes: before };
        }

        if let Err(e) = self.accelerator.clear_cache() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(accelerator = self.accelerator.name(), error = %e, "Failed to clear accelerator cache");
            return ReclaimOutcome::Failed(e.to_string());
        }

        let after = self
            .accelerator
            .stats()
            .map(|s| s.cache_bytes)
            .unwrap_or(0);
        let freed = before.saturating_sub(after);

        self.stats.reclaims.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_freed.fetch_add(freed, Ordering::Relaxed);
        info!(
            before_bytes = before,
            after_bytes = after,
            bytes_freed = freed,
            limit_bytes = self.cache_limit_bytes,
            "Reclaimed accelerator cache"
        );

        ReclaimOutcome::Reclaimed { before, after, freed }
    }

    /// Start the background loop
    ///
    /// The first pass happens one full interval after spawning. The loop stops
    /// when the returned handle is shut down or dropped.
    pub fn spawn(self) -> ReclaimerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let stats = self.stats();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = period.as_secs(), limit_bytes = self.cache_limit_bytes, "Cache reclaimer started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.reclaim_once();
                    }
                }
            }

            info!("Cache reclaimer stopped");
        });

        ReclaimerHandle {
            shutdown_tx: Some(shutdown_tx),
            handle,
            stats,
        }
    }
}

/// Owner of a running reclaimer task
pub struct ReclaimerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
    stats: Arc<ReclaimerStats>,
}

impl ReclaimerHandle {
    pub fn stats(&self) -> Arc<ReclaimerStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop to stop and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match (&mut self.handle).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => debug!("Cache reclaimer was cancelled"),
            Err(e) => warn!(error = %e, "Cache reclaimer task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAccelerator;
    use crate::NullAccelerator;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn config(limit: u64) -> ReclaimerConfig {
        ReclaimerConfig {
            enabled: true,
            interval_secs: 300,
            cache_limit_bytes: limit,
        }
    }

    #[test]
    fn test_reclaims_only_over_budget() {
        let accel = Arc::new(MockAccelerator::new());
        let reclaimer = CacheReclaimer::new(accel.clone(), config(4 * GIB));

        accel.set_cache_bytes(GIB);
        assert_eq!(reclaimer.reclaim_once(), ReclaimOutcome::UnderBudget { cache_bytes: GIB });
        assert_eq!(accel.clear_count(), 0);

        accel.set_cache_bytes(5 * GIB);
        assert_eq!(
            reclaimer.reclaim_once(),
            ReclaimOutcome::Reclaimed {
                before: 5 * GIB,
                after: 0,
                freed: 5 * GIB
            }
        );
        assert_eq!(accel.clear_count(), 1);

        let stats = reclaimer.stats().snapshot();
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.reclaims, 1);
        assert_eq!(stats.bytes_freed, 5 * GIB);
    }

    #[test]
    fn test_unavailable_accelerator_is_skipped() {
        let reclaimer = CacheReclaimer::new(Arc::new(NullAccelerator), config(0));
        assert_eq!(reclaimer.reclaim_once(), ReclaimOutcome::Unavailable);
    }

    #[test]
    fn test_clear_failure_is_counted() {
        let accel = Arc::new(MockAccelerator::new());
        accel.set_cache_bytes(5 * GIB);
        accel.fail_clears(true);
        let reclaimer = CacheReclaimer::new(accel.clone(), config(GIB));

        assert!(matches!(reclaimer.reclaim_once(), ReclaimOutcome::Failed(_)));
        assert_eq!(reclaimer.stats().snapshot().errors, 1);
        assert_eq!(accel.cache_bytes(), 5 * GIB);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_on_interval_and_stops_on_shutdown() {
        let accel = Arc::new(MockAccelerator::new());
        accel.set_cache_bytes(5 * GIB);
        let handle = CacheReclaimer::new(accel.clone(), config(GIB)).spawn();

        // nothing happens before the first full interval
        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(accel.clear_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(accel.clear_count(), 1);

        accel.set_cache_bytes(6 * GIB);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(accel.clear_count(), 2);
        assert_eq!(handle.stats().snapshot().bytes_freed, 11 * GIB);

        handle.shutdown().await;

        accel.set_cache_bytes(6 * GIB);
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(accel.clear_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_loop() {
        let accel = Arc::new(MockAccelerator::new());
        accel.set_cache_bytes(5 * GIB);
        let handle = CacheReclaimer::new(accel.clone(), config(GIB)).spawn();
        drop(handle);

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(accel.clear_count(), 0);
    }
}
