//! Helper-service health probes

use crate::{Result, RuntimeError};
use async_trait::async_trait;
use lmx_core::{HelperProbe, HelperStatus};
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::warn;

/// Probes a helper service by issuing a GET against its health URL
///
/// Any 2xx response counts as healthy. The client timeout bounds every probe.
pub struct HttpHelperProbe {
    name: String,
    url: String,
    client: Client,
}

impl HttpHelperProbe {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HelperProbe for HttpHelperProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> HelperStatus {
        let start = Instant::now();

        let status = match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => {
                HelperStatus::healthy(&self.name, start.elapsed().as_secs_f64() * 1000.0)
            }
            Ok(response) => HelperStatus::unhealthy(&self.name, format!("HTTP {}", response.status().as_u16())),
            Err(e) if e.is_timeout() => HelperStatus::unhealthy(&self.name, "timed out"),
            Err(e) => HelperStatus::unhealthy(&self.name, e.to_string()),
        };

        if !status.healthy {
            warn!(helper = %self.name, url = %self.url, error = ?status.error, "Helper service unhealthy");
        }

        status.with_url(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};

    async fn spawn_helper() -> String {
        let app = Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_healthy_helper() {
        let base = spawn_helper().await;
        let probe = HttpHelperProbe::new("embed", format!("{}/healthz", base), Duration::from_secs(2)).unwrap();

        let status = probe.probe().await;
        assert!(status.healthy);
        assert!(status.latency_ms.is_some());
        assert_eq!(status.url.as_deref(), Some(probe.url()));
    }

    #[tokio::test]
    async fn test_error_status_is_unhealthy() {
        let base = spawn_helper().await;
        let probe = HttpHelperProbe::new("rerank", format!("{}/broken", base), Duration::from_secs(2)).unwrap();

        let status = probe.probe().await;
        assert!(!status.healthy);
        assert_eq!(status.error.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn test_slow_helper_times_out() {
        let base = spawn_helper().await;
        let probe = HttpHelperProbe::new("slow", format!("{}/slow", base), Duration::from_millis(200)).unwrap();

        let start = Instant::now();
        let status = probe.probe().await;
        assert!(!status.healthy);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
