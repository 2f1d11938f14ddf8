//! Mock inference runtime and helper probes for testing

use async_trait::async_trait;
use lmx_core::{
    Error, GenerationRequest, GenerationResponse, HelperProbe, HelperStatus, InferenceRuntime, Result,
};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// In-process runtime with configurable failures and latency
#[derive(Debug, Default)]
pub struct MockRuntime {
    loaded: RwLock<Vec<String>>,
    failing_models: RwLock<HashSet<String>>,
    generate_delay: RwLock<Duration>,
    load_attempts: RwLock<Vec<String>>,
    generations: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every load of `model_id` fail
    pub fn fail_model(&self, model_id: impl Into<String>) {
        self.failing_models.write().insert(model_id.into());
    }

    pub fn with_generate_delay(self, delay: Duration) -> Self {
        *self.generate_delay.write() = delay;
        self
    }

    /// Every model id passed to `load_model`, in call order
    pub fn load_attempts(&self) -> Vec<String> {
        self.load_attempts.read().clone()
    }

    pub fn generation_count(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceRuntime for MockRuntime {
    fn runtime_type(&self) -> &str {
        "mock"
    }

    async fn load_model(&self, model_id: &str) -> Result<()> {
        self.load_attempts.write().push(model_id.to_string());

        if self.failing_models.read().contains(model_id) {
            return Err(Error::runtime(format!("mock load failure for {}", model_id)));
        }

        let mut loaded = self.loaded.write();
        if !loaded.iter().any(|m| m == model_id) {
            loaded.push(model_id.to_string());
        }
        Ok(())
    }

    async fn unload_model(&self, model_id: &str) -> Result<()> {
        let mut loaded = self.loaded.write();
        let before = loaded.len();
        loaded.retain(|m| m != model_id);
        if loaded.len() == before {
            return Err(Error::not_found(format!("model {} is not loaded", model_id)));
        }
        Ok(())
    }

    async fn loaded_models(&self) -> Vec<String> {
        self.loaded.read().clone()
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        if !self.loaded.read().iter().any(|m| *m == request.model) {
            return Err(Error::not_found(format!("model {} is not loaded", request.model)));
        }

        let delay = *self.generate_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.generations.fetch_add(1, Ordering::SeqCst);

        Ok(GenerationResponse {
            body: json!({
                "object": "chat.completion",
                "model": request.model,
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "mock"}}],
            }),
        })
    }
}

/// Helper probe with a settable health flag
#[derive(Debug)]
pub struct MockHelper {
    name: String,
    healthy: AtomicBool,
}

impl MockHelper {
    pub fn new(name: impl Into<String>, healthy: bool) -> Self {
        Self {
            name: name.into(),
            healthy: AtomicBool::new(healthy),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HelperProbe for MockHelper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> HelperStatus {
        if self.healthy.load(Ordering::SeqCst) {
            HelperStatus::healthy(&self.name, 1.0)
        } else {
            HelperStatus::unhealthy(&self.name, "mock helper down")
        }
    }
}
