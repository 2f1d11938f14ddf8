//! Host memory monitor backed by sysinfo
//!
//! The `sysinfo::System` instance is created once and reused. Callers only
//! ever copy the cached reading out from under a short lock; once it is older
//! than the TTL a refresh runs on tokio's blocking pool and the caller gets
//! the previous reading in the meantime. Outside a runtime the refresh runs
//! inline.

use lmx_core::{Error, HostMemory, MemoryMonitor, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::warn;

const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(500);

/// Cached host memory reader
pub struct SystemMemoryMonitor {
    shared: Arc<Shared>,
    cache_ttl: Duration,
}

struct Shared {
    system: Mutex<System>,
    latest: Mutex<Option<Reading>>,
    refreshing: AtomicBool,
}

#[derive(Clone, Copy)]
struct Reading {
    at: Instant,
    memory: HostMemory,
}

impl Shared {
    /// Blocking: reads the OS counters
    fn refresh(&self) {
        let memory = {
            let mut system = self.system.lock();
            system.refresh_memory();
            HostMemory {
                total_bytes: system.total_memory(),
                used_bytes: system.used_memory(),
                available_bytes: system.available_memory(),
            }
        };

        if memory.total_bytes == 0 {
            warn!("Host memory total reported as zero, keeping previous reading");
            return;
        }
        *self.latest.lock() = Some(Reading {
            at: Instant::now(),
            memory,
        });
    }
}

impl SystemMemoryMonitor {
    pub fn new() -> Self {
        Self::with_cache_ttl(DEFAULT_CACHE_TTL)
    }

    /// Takes the first reading immediately
    pub fn with_cache_ttl(cache_ttl: Duration) -> Self {
        let shared = Arc::new(Shared {
            system: Mutex::new(System::new()),
            latest: Mutex::new(None),
            refreshing: AtomicBool::new(false),
        });
        shared.refresh();
        Self { shared, cache_ttl }
    }

    /// Age of the reading `host_memory` currently returns
    pub fn reading_age(&self) -> Option<Duration> {
        self.shared.latest.lock().map(|reading| reading.at.elapsed())
    }

    /// Start a refresh on the blocking pool; false when there is no runtime
    fn refresh_in_background(&self) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        if self.shared.refreshing.swap(true, Ordering::AcqRel) {
            return true;
        }

        let shared = Arc::clone(&self.shared);
        handle.spawn_blocking(move || {
            shared.refresh();
            shared.refreshing.store(false, Ordering::Release);
        });
        true
    }
}

impl Default for SystemMemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMonitor for SystemMemoryMonitor {
    fn host_memory(&self) -> Result<HostMemory> {
        let latest = *self.shared.latest.lock();

        let fresh = latest.is_some_and(|reading| reading.at.elapsed() < self.cache_ttl);
        if fresh {
            return latest
                .map(|reading| reading.memory)
                .ok_or_else(|| Error::internal("host memory reading unavailable"));
        }

        let latest = if self.refresh_in_background() {
            latest
        } else {
            self.shared.refresh();
            *self.shared.latest.lock()
        };

        latest
            .map(|reading| reading.memory)
            .ok_or_else(|| Error::internal("host memory reading unavailable"))
    }
}
