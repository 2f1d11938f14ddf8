//! Accelerator backends

use lmx_core::{Accelerator, AcceleratorStats, Result};

/// Backend for hosts without a managed accelerator allocator
///
/// Reports itself unavailable; clearing the cache is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAccelerator;

impl Accelerator for NullAccelerator {
    fn name(&self) -> &str {
        "none"
    }

    fn stats(&self) -> Result<AcceleratorStats> {
        Ok(AcceleratorStats::unavailable())
    }

    fn clear_cache(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_accelerator_is_unavailable() {
        let accel = NullAccelerator;
        let stats = accel.stats().unwrap();
        assert!(!stats.available);
        assert_eq!(stats.cache_bytes, 0);
        assert!(accel.clear_cache().is_ok());
    }
}
