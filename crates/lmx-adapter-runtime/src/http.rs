//! Inference runtime backed by an OpenAI-compatible upstream server

use crate::{Result, RuntimeError};
use async_trait::async_trait;
use lmx_core::config::RuntimeConfig;
use lmx_core::{GenerationRequest, GenerationResponse, InferenceRuntime};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Forwards generation requests to an upstream server
///
/// The upstream owns the weights; "loading" a model here activates one of
/// the models the upstream advertises on `/v1/models`.
pub struct HttpRuntime {
    endpoint: String,
    client: Client,
    active: RwLock<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl HttpRuntime {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        info!(endpoint = %config.endpoint, "Creating HTTP inference runtime");

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RuntimeError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
            active: RwLock::new(Vec::new()),
        })
    }

    /// Models the upstream currently serves
    pub async fn upstream_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/models", self.endpoint);
        debug!(%url, "Fetching upstream models");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RuntimeError::from_reqwest("Failed to list upstream models", e))?;

        if !response.status().is_success() {
            return Err(RuntimeError::Upstream {
                status: response.status().as_u16(),
                message: "models request failed".to_string(),
            });
        }

        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::InvalidResponse(format!("Invalid models response: {}", e)))?;

        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    fn is_active(&self, model_id: &str) -> bool {
        self.active.read().iter().any(|m| m == model_id)
    }
}

#[async_trait]
impl InferenceRuntime for HttpRuntime {
    fn runtime_type(&self) -> &str {
        "http"
    }

    async fn load_model(&self, model_id: &str) -> lmx_core::Result<()> {
        if self.is_active(model_id) {
            return Ok(());
        }

        let available = self.upstream_models().await?;
        if !available.iter().any(|m| m == model_id) {
            return Err(RuntimeError::ModelUnavailable(model_id.to_string()).into());
        }

        let mut active = self.active.write();
        if !active.iter().any(|m| m == model_id) {
            active.push(model_id.to_string());
        }
        info!(model_id, "Model activated on upstream runtime");
        Ok(())
    }

    async fn unload_model(&self, model_id: &str) -> lmx_core::Result<()> {
        let mut active = self.active.write();
        let before = active.len();
        active.retain(|m| m != model_id);
        if active.len() == before {
            return Err(RuntimeError::ModelNotLoaded(model_id.to_string()).into());
        }
        info!(model_id, "Model deactivated");
        Ok(())
    }

    async fn loaded_models(&self) -> Vec<String> {
        self.active.read().clone()
    }

    async fn generate(&self, request: GenerationRequest) -> lmx_core::Result<GenerationResponse> {
        if !self.is_active(&request.model) {
            return Err(RuntimeError::ModelNotLoaded(request.model).into());
        }

        let url = format!("{}/v1/{}", self.endpoint, request.endpoint.trim_start_matches('/'));
        let mut builder = self.client.post(&url).json(&request.body);
        if let Some(id) = &request.request_id {
            builder = builder.header("x-request-id", id);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RuntimeError::from_reqwest("Generation request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(model = %request.model, status = status.as_u16(), "Upstream generation failed");
            return Err(RuntimeError::Upstream {
                status: status.as_u16(),
                message,
            }
            .into());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RuntimeError::InvalidResponse(format!("Invalid generation response: {}", e)))?;

        Ok(GenerationResponse { body })
    }
}
