//! # lmx-adapter-accel
//!
//! Memory telemetry and accelerator cache management for lmx.
//!
//! This crate provides:
//! - [`SystemMemoryMonitor`], a cached host memory reader backed by `sysinfo`
//! - [`NullAccelerator`] for hosts without an accelerator backend
//! - [`CacheReclaimer`], the background loop that releases the accelerator's
//!   buffer cache when it grows past a budget
//! - Mock implementations for tests (`mock` feature)
//!
//! ## Example
//!
//! ```rust,no_run
//! use lmx_adapter_accel::{CacheReclaimer, NullAccelerator, SystemMemoryMonitor};
//! use lmx_core::{MemoryMonitor, ReclaimerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let monitor = SystemMemoryMonitor::new();
//!     println!("memory: {:.1}%", monitor.host_memory()?.usage_percent());
//!
//!     let reclaimer = CacheReclaimer::new(Arc::new(NullAccelerator), ReclaimerConfig::default());
//!     let handle = reclaimer.spawn();
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod accelerator;
pub mod memory;
pub mod reclaimer;

#[cfg(any(feature = "mock", test))]
pub mod mock;

pub use accelerator::NullAccelerator;
pub use memory::SystemMemoryMonitor;
pub use reclaimer::{CacheReclaimer, ReclaimOutcome, ReclaimerHandle, ReclaimerSnapshot, ReclaimerStats};
