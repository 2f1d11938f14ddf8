//! Core traits for lmx components
//!
//! These traits define the collaborator interfaces consumed by the admission
//! and lifecycle layer: memory telemetry, accelerator cache control, the
//! inference runtime itself and helper-service health probes.

use crate::{AcceleratorStats, GenerationRequest, GenerationResponse, HelperStatus, HostMemory, Result};
use async_trait::async_trait;

/// Read-only host memory telemetry
///
/// Implementations must be cheap enough to call once per request.
pub trait MemoryMonitor: Send + Sync {
    /// Current host memory reading
    fn host_memory(&self) -> Result<HostMemory>;
}

/// Accelerator allocator telemetry and cache control
pub trait Accelerator: Send + Sync {
    /// Backend name for logs and diagnostics
    fn name(&self) -> &str;

    /// Current allocator statistics
    fn stats(&self) -> Result<AcceleratorStats>;

    /// Release cached-but-unused buffers held by the allocator
    fn clear_cache(&self) -> Result<()>;
}

/// The tensor-inference runtime, treated as an opaque collaborator
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    /// Runtime type name (http, mock, ...)
    fn runtime_type(&self) -> &str;

    /// Load a model so that it can serve generation requests
    async fn load_model(&self, model_id: &str) -> Result<()>;

    /// Unload a model
    async fn unload_model(&self, model_id: &str) -> Result<()>;

    /// Models currently loaded, in load order
    async fn loaded_models(&self) -> Vec<String>;

    /// Run one generation request
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse>;
}

/// Health probe for a helper service consulted by deep health
#[async_trait]
pub trait HelperProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Probe the service; never returns an error, failures are reported in the status
    async fn probe(&self) -> HelperStatus;
}
