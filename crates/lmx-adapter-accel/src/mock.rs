//! Mock memory monitor and accelerator for testing

use lmx_core::{Accelerator, AcceleratorStats, Error, HostMemory, MemoryMonitor, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const MOCK_TOTAL_BYTES: u64 = 64 * 1024 * 1024 * 1024;

/// Memory monitor reporting a settable usage percentage
#[derive(Debug)]
pub struct MockMemoryMonitor {
    percent_bits: AtomicU64,
    failing: AtomicBool,
}

impl MockMemoryMonitor {
    pub fn new(usage_percent: f64) -> Self {
        Self {
            percent_bits: AtomicU64::new(usage_percent.to_bits()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_usage_percent(&self, usage_percent: f64) {
        self.percent_bits.store(usage_percent.to_bits(), Ordering::SeqCst);
    }

    pub fn usage_percent(&self) -> f64 {
        f64::from_bits(self.percent_bits.load(Ordering::SeqCst))
    }

    /// Make subsequent reads fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for MockMemoryMonitor {
    fn default() -> Self {
        Self::new(50.0)
    }
}

impl MemoryMonitor for MockMemoryMonitor {
    fn host_memory(&self) -> Result<HostMemory> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::internal("mock memory read failure"));
        }
        Ok(HostMemory::from_percent(MOCK_TOTAL_BYTES, self.usage_percent()))
    }
}

/// Accelerator with settable allocator counters
#[derive(Debug, Default)]
pub struct MockAccelerator {
    active_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    cache_bytes: AtomicU64,
    clears: AtomicU64,
    fail_clears: AtomicBool,
}

impl MockAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active_bytes(&self, bytes: u64) {
        self.active_bytes.store(bytes, Ordering::SeqCst);
        self.peak_bytes.fetch_max(bytes, Ordering::SeqCst);
    }

    pub fn set_cache_bytes(&self, bytes: u64) {
        self.cache_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn cache_bytes(&self) -> u64 {
        self.cache_bytes.load(Ordering::SeqCst)
    }

    pub fn fail_clears(&self, fail: bool) {
        self.fail_clears.store(fail, Ordering::SeqCst);
    }

    /// Number of successful cache clears
    pub fn clear_count(&self) -> u64 {
        self.clears.load(Ordering::SeqCst)
    }
}

impl Accelerator for MockAccelerator {
    fn name(&self) -> &str {
        "mock"
    }

    fn stats(&self) -> Result<AcceleratorStats> {
        Ok(AcceleratorStats {
            available: true,
            active_bytes: self.active_bytes.load(Ordering::SeqCst),
            peak_bytes: self.peak_bytes.load(Ordering::SeqCst),
            cache_bytes: self.cache_bytes.load(Ordering::SeqCst),
        })
    }

    fn clear_cache(&self) -> Result<()> {
        if self.fail_clears.load(Ordering::SeqCst) {
            return Err(Error::accelerator("mock clear failure"));
        }
        self.cache_bytes.store(0, Ordering::SeqCst);
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
