//! HTTP server and route table

use crate::admission::AdmissionController;
use crate::auth::{require_admin, AdminAuth};
use crate::handler;
use crate::health::{HealthReporter, LifecycleStatus};
use crate::models::ModelManager;
use crate::rate_limit::{rate_limit_requests, RateLimiter};
use crate::shedding::{shed_requests, LoadShedder};
use crate::{Result, RouterError, LIVENESS_PATH, READINESS_PATH};

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use lmx_adapter_accel::ReclaimerStats;
use lmx_core::config::ServerConfig;
use lmx_core::{Accelerator, Config, HelperProbe, InferenceRuntime, MemoryMonitor};
use lmx_metrics::MetricsRegistry;
use lmx_state::RuntimeStateStore;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// External collaborators the HTTP layer is built on
pub struct Collaborators {
    pub runtime: Arc<dyn InferenceRuntime>,
    pub memory: Arc<dyn MemoryMonitor>,
    pub accelerator: Arc<dyn Accelerator>,
    pub helpers: Vec<Arc<dyn HelperProbe>>,
    pub state_store: Arc<RuntimeStateStore>,
}

/// Shared application state handed to every handler and middleware
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionController>,
    pub shedder: Arc<LoadShedder>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth: AdminAuth,
    pub health: Arc<HealthReporter>,
    pub models: Arc<ModelManager>,
    pub metrics: MetricsRegistry,
    pub accelerator: Arc<dyn Accelerator>,
    pub memory: Arc<dyn MemoryMonitor>,
    pub reclaimer_stats: Option<Arc<ReclaimerStats>>,
    pub inference_timeout: Duration,
    pub metrics_enabled: bool,
}

impl AppState {
    pub fn new(config: &Config, collaborators: Collaborators, metrics: MetricsRegistry) -> Self {
        let Collaborators {
            runtime,
            memory,
            accelerator,
            helpers,
            state_store,
        } = collaborators;

        let admission = Arc::new(AdmissionController::from_config(&config.admission));
        let lifecycle = Arc::new(LifecycleStatus::new());
        let health = Arc::new(HealthReporter::new(
            &config.health,
            Arc::clone(&memory),
            Arc::clone(&accelerator),
            Arc::clone(&runtime),
            helpers,
            Arc::clone(&admission),
            lifecycle,
        ));

        Self {
            admission,
            shedder: Arc::new(LoadShedder::new(Arc::clone(&memory), &config.shedding)),
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            auth: AdminAuth::from_config(&config.security),
            health,
            models: Arc::new(ModelManager::new(runtime, state_store)),
            metrics,
            accelerator,
            memory,
            reclaimer_stats: None,
            inference_timeout: config.admission.inference_timeout(),
            metrics_enabled: config.observability.metrics_enabled,
        }
    }

    /// Feed reclaimer counters into metrics export
    pub fn with_reclaimer_stats(mut self, stats: Arc<ReclaimerStats>) -> Self {
        self.reclaimer_stats = Some(stats);
        self
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleStatus> {
        self.health.lifecycle()
    }

    /// Copy live component state into the metric gauges
    pub async fn refresh_metrics(&self) {
        self.metrics.set_admission(
            self.admission.in_flight(),
            self.admission.waiting(),
            self.admission.capacity(),
        );

        if let Ok(memory) = self.memory.host_memory() {
            self.metrics.set_memory_usage(memory.usage_percent());
        }
        if let Ok(stats) = self.accelerator.stats() {
            self.metrics
                .set_accelerator(stats.active_bytes, stats.peak_bytes, stats.cache_bytes);
        }
        if let Some(stats) = &self.reclaimer_stats {
            let snapshot = stats.snapshot();
            self.metrics
                .set_cache_reclaims(snapshot.reclaims, snapshot.bytes_freed);
        }

        self.metrics
            .set_loaded_models(self.models.loaded_models().await.len());
        let lifecycle = self.lifecycle();
        self.metrics
            .set_lifecycle(lifecycle.safe_mode(), lifecycle.startup_count());
    }
}

/// Build the route table
///
/// Request order: rate limiter, load shedder, then admin auth on `/admin/*`,
/// then the handler. Probe paths pass through the first two untouched.
pub fn create_router(state: AppState, enable_cors: bool) -> AxumRouter {
    let admin = AxumRouter::new()
        .route("/admin/health", get(handler::deep_health))
        .route("/admin/metrics", get(handler::metrics))
        .route("/admin/models", get(handler::admin_list_models))
        .route("/admin/models/load", post(handler::load_model))
        .route("/admin/models/unload", post(handler::unload_model))
        .route_layer(from_fn_with_state(state.clone(), require_admin));

    let mut router = AxumRouter::new()
        .route(LIVENESS_PATH, get(handler::liveness))
        .route(READINESS_PATH, get(handler::readiness))
        .route("/v1/chat/completions", post(handler::chat_completions))
        .route("/v1/completions", post(handler::completions))
        .route("/v1/models", get(handler::list_models))
        .merge(admin)
        .layer(from_fn_with_state(state.clone(), shed_requests))
        .layer(from_fn_with_state(state.clone(), rate_limit_requests))
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

/// HTTP server for the inference API, probes and admin routes
pub struct HttpServer {
    addr: SocketAddr,
    enable_cors: bool,
    state: AppState,
}

impl HttpServer {
    pub fn new(config: &ServerConfig, state: AppState) -> Self {
        Self {
            addr: SocketAddr::new(config.host, config.port),
            enable_cors: config.enable_cors,
            state,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.addr)
            .await
            .map_err(|e| RouterError::Server(format!("Failed to bind to {}: {}", self.addr, e)))
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind().await?;
        self.serve_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    ///
    /// In-flight requests are allowed to finish after the signal.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Starting HTTP server");

        let app = create_router(self.state, self.enable_cors);

        if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "HTTP server error");
            return Err(RouterError::Server(format!("HTTP server failed: {}", e)));
        }

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RouteGroup;
    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use axum::http::{header, Method, Request, StatusCode};
    use lmx_adapter_accel::mock::{MockAccelerator, MockMemoryMonitor};
    use lmx_adapter_runtime::mock::{MockHelper, MockRuntime};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const ADMIN_KEY: &str = "test-key";

    struct Harness {
        _dir: TempDir,
        state: AppState,
        memory: Arc<MockMemoryMonitor>,
        runtime: Arc<MockRuntime>,
        store: Arc<RuntimeStateStore>,
    }

    fn harness_with(mut config: Config, runtime: MockRuntime) -> Harness {
        config.security.admin_key = Some(ADMIN_KEY.to_string());
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MockMemoryMonitor::new(50.0));
        let runtime = Arc::new(runtime);
        let store = Arc::new(RuntimeStateStore::new(dir.path().join("state.json")));

        let state = AppState::new(
            &config,
            Collaborators {
                runtime: runtime.clone(),
                memory: memory.clone(),
                accelerator: Arc::new(MockAccelerator::new()),
                helpers: vec![Arc::new(MockHelper::new("embeddings", true))],
                state_store: store.clone(),
            },
            MetricsRegistry::new().unwrap(),
        );

        Harness {
            _dir: dir,
            state,
            memory,
            runtime,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default(), MockRuntime::new())
    }

    fn request(method: Method, uri: &str, client: [u8; 4], body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let mut request = builder.body(body).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((client, 40000))));
        request
    }

    fn admin(mut request: Request<Body>) -> Request<Body> {
        request
            .headers_mut()
            .insert("x-admin-key", ADMIN_KEY.parse().unwrap());
        request
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = create_router(state.clone(), false)
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    const CLIENT: [u8; 4] = [10, 0, 0, 1];

    #[tokio::test]
    async fn test_liveness_at_high_memory_without_models() {
        let h = harness();
        h.memory.set_usage_percent(99.0);

        let (status, _, body) = send(&h.state, request(Method::GET, "/healthz", CLIENT, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");
    }

    #[tokio::test]
    async fn test_readiness_flips_on_load_and_unload() {
        let h = harness();

        let (status, _, body) = send(&h.state, request(Method::GET, "/readyz", CLIENT, None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unavailable");

        let load = admin(request(Method::POST, "/admin/models/load", CLIENT, Some(json!({"model_id": "m1"}))));
        let (status, _, _) = send(&h.state, load).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(&h.state, request(Method::GET, "/readyz", CLIENT, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["models_loaded"], 1);

        let unload = admin(request(Method::POST, "/admin/models/unload", CLIENT, Some(json!({"model_id": "m1"}))));
        let (status, _, _) = send(&h.state, unload).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = send(&h.state, request(Method::GET, "/readyz", CLIENT, None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let state = h.store.load().await.unwrap().unwrap();
        assert!(state.loaded_models.is_empty());
        assert!(!state.last_clean_shutdown);
    }

    #[tokio::test]
    async fn test_shedding_spares_probes() {
        let h = harness();
        h.runtime.load_model("m1").await.unwrap();
        h.memory.set_usage_percent(96.0);

        let chat = request(
            Method::POST,
            "/v1/chat/completions",
            CLIENT,
            Some(json!({"model": "m1", "messages": []})),
        );
        let (status, headers, body) = send(&h.state, chat).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "shed");
        assert_eq!(headers[header::RETRY_AFTER], "30");
        assert_eq!(h.runtime.generation_count(), 0);

        let (status, _, _) = send(&h.state, request(Method::GET, "/readyz", CLIENT, None)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = send(&h.state, request(Method::GET, "/healthz", CLIENT, None)).await;
        assert_eq!(status, StatusCode::OK);

        // deep health is not exempt
        let (status, _, _) = send(&h.state, admin(request(Method::GET, "/admin/health", CLIENT, None))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_inference_round_trip() {
        let h = harness();
        h.runtime.load_model("m1").await.unwrap();

        let chat = request(
            Method::POST,
            "/v1/chat/completions",
            CLIENT,
            Some(json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]})),
        );
        let (status, headers, body) = send(&h.state, chat).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], "m1");
        assert!(headers.contains_key("x-request-id"));
        assert_eq!(h.state.admission.in_flight(), 0);

        let missing = request(
            Method::POST,
            "/v1/chat/completions",
            CLIENT,
            Some(json!({"model": "nope", "messages": []})),
        );
        let (status, _, body) = send(&h.state, missing).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");

        let invalid = request(Method::POST, "/v1/completions", CLIENT, Some(json!({"prompt": "x"})));
        let (status, _, _) = send(&h.state, invalid).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_busy_when_all_slots_held() {
        let mut config = Config::default();
        config.admission.max_concurrent_requests = 1;
        config.admission.acquire_timeout_ms = 20;
        let h = harness_with(config, MockRuntime::new());
        h.runtime.load_model("m1").await.unwrap();

        let _held = h.state.admission.acquire(lmx_core::Priority::Normal, None).await.unwrap();

        let chat = request(Method::POST, "/v1/chat/completions", CLIENT, Some(json!({"model": "m1"})));
        let (status, headers, body) = send(&h.state, chat).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "busy");
        assert_eq!(headers[header::RETRY_AFTER], "5");

        // admin callers may jump the gate
        let high = admin(request(
            Method::POST,
            "/v1/chat/completions",
            CLIENT,
            Some(json!({"model": "m1", "priority": "high"})),
        ));
        let (status, _, _) = send(&h.state, high).await;
        assert_eq!(status, StatusCode::OK);

        // everyone else is held to normal priority
        let spoofed = request(
            Method::POST,
            "/v1/chat/completions",
            CLIENT,
            Some(json!({"model": "m1", "priority": "high"})),
        );
        let (status, _, _) = send(&h.state, spoofed).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_inference_timeout_is_gateway_timeout() {
        let mut config = Config::default();
        config.admission.inference_timeout_secs = 1;
        let h = harness_with(config, MockRuntime::new().with_generate_delay(Duration::from_secs(5)));
        h.runtime.load_model("m1").await.unwrap();

        let chat = request(Method::POST, "/v1/chat/completions", CLIENT, Some(json!({"model": "m1"})));
        let (status, _, body) = send(&h.state, chat).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"]["code"], "timeout");
        assert_eq!(h.state.admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_per_client_and_probes_exempt() {
        let mut config = Config::default();
        config.rate_limit.inference.burst = 2;
        let h = harness_with(config, MockRuntime::new());

        for _ in 0..2 {
            let (status, _, _) = send(&h.state, request(Method::GET, "/v1/models", CLIENT, None)).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, headers, body) = send(&h.state, request(Method::GET, "/v1/models", CLIENT, None)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "rate_limited");
        assert!(headers.contains_key(header::RETRY_AFTER));

        // another client has its own bucket
        let (status, _, _) = send(&h.state, request(Method::GET, "/v1/models", [10, 0, 0, 2], None)).await;
        assert_eq!(status, StatusCode::OK);

        for _ in 0..20 {
            let (status, _, _) = send(&h.state, request(Method::GET, "/healthz", CLIENT, None)).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert!(h.state.rate_limiter.check(RouteGroup::Admin, "10.0.0.1").is_ok());
    }

    #[tokio::test]
    async fn test_admin_routes_require_key() {
        let h = harness();

        let (status, _, body) = send(&h.state, request(Method::GET, "/admin/health", CLIENT, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "unauthorized");
        assert_eq!(body["error"]["message"], "Invalid or missing admin key");

        let (status, _, body) = send(&h.state, admin(request(Method::GET, "/admin/health", CLIENT, None))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["admission"]["capacity"], 4);
        assert_eq!(body["helpers"][0]["name"], "embeddings");
    }

    #[tokio::test]
    async fn test_deep_health_degraded_at_high_memory() {
        let h = harness();
        h.memory.set_usage_percent(94.0);

        let (status, _, body) = send(&h.state, admin(request(Method::GET, "/admin/health", CLIENT, None))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_metrics_export() {
        let h = harness();
        h.runtime.load_model("m1").await.unwrap();
        h.state.lifecycle().set(true, 3);

        let response = create_router(h.state.clone(), false)
            .oneshot(admin(request(Method::GET, "/admin/metrics", CLIENT, None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("lmx_admission_in_flight_requests 0"));
        assert!(text.contains("lmx_admission_capacity 4"));
        assert!(text.contains("lmx_loaded_models 1"));
        assert!(text.contains("lmx_safe_mode 1"));
        assert!(text.contains("lmx_memory_usage_percent 50"));
    }

    #[tokio::test]
    async fn test_serves_over_tcp_with_graceful_shutdown() {
        let h = harness();
        let server = HttpServer::new(
            &ServerConfig {
                port: 0,
                ..ServerConfig::default()
            },
            h.state.clone(),
        );
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.serve_with_listener(listener, async move {
            let _ = rx.await;
        }));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
