//! # lmx-core
//!
//! Core types, traits, and utilities for lmx, the admission-control and
//! resource-lifecycle layer of a local LLM inference server.
//!
//! This crate provides the foundational pieces shared by every other lmx crate:
//!
//! - Unified error type with HTTP status, reason code and retry hint mapping
//! - Configuration schema and layered loading (defaults, YAML, environment)
//! - Collaborator traits for memory telemetry, accelerator cache control,
//!   the inference runtime and helper-service probes
//! - Shared data types

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{
    AdmissionConfig, Config, HealthConfig, HelperConfig, RateLimitConfig, RateLimitRule,
    ReclaimerConfig, SheddingConfig, StateConfig,
};
pub use error::{Error, Result};
pub use traits::{Accelerator, HelperProbe, InferenceRuntime, MemoryMonitor};
pub use types::{
    AcceleratorStats, GenerationRequest, GenerationResponse, HelperStatus, HostMemory, Priority,
};
