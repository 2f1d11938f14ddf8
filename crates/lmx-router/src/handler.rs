//! HTTP handlers

use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use lmx_core::{Error, GenerationRequest, Priority};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Body of the admin load/unload routes
#[derive(Debug, Deserialize)]
pub struct ModelRequest {
    pub model_id: String,
}

/// Liveness probe
pub async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.liveness())
}

/// Readiness probe: 200 with at least one model loaded, 503 otherwise
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let readiness = state.health.readiness().await;
    let status = if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

/// Deep health snapshot
pub async fn deep_health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.health.snapshot().await;
    for helper in &snapshot.helpers {
        state.metrics.set_helper_up(&helper.name, helper.healthy);
    }
    Json(snapshot)
}

/// Prometheus text exposition, refreshed from live state on every scrape
pub async fn metrics(State(state): State<AppState>) -> ApiResult<Response> {
    if !state.metrics_enabled {
        return Err(Error::not_found("metrics export is disabled").into());
    }

    state.refresh_metrics().await;
    let body = state
        .metrics
        .export_text()
        .map_err(|e| Error::internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}

/// Loaded models, admin view
pub async fn admin_list_models(State(state): State<AppState>) -> impl IntoResponse {
    let loaded = state.models.loaded_models().await;
    Json(json!({
        "models": loaded,
        "count": loaded.len(),
        "safe_mode": state.health.lifecycle().safe_mode(),
    }))
}

pub async fn load_model(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ModelRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload.map_err(|e| Error::invalid_request(e.body_text()))?;
    state.models.load(&request.model_id).await?;
    Ok(Json(json!({
        "status": "loaded",
        "model_id": request.model_id,
        "models": state.models.loaded_models().await,
    })))
}

pub async fn unload_model(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ModelRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload.map_err(|e| Error::invalid_request(e.body_text()))?;
    state.models.unload(&request.model_id).await?;
    Ok(Json(json!({
        "status": "unloaded",
        "model_id": request.model_id,
        "models": state.models.loaded_models().await,
    })))
}

/// Loaded models in the OpenAI list format
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let data: Vec<Value> = state
        .models
        .loaded_models()
        .await
        .into_iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "lmx"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> ApiResult<Response> {
    run_inference(state, headers, "chat/completions", payload).await
}

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> ApiResult<Response> {
    run_inference(state, headers, "completions", payload).await
}

/// Admit, generate and release
///
/// The slot is held by the permit for exactly the duration of the runtime
/// call and released on every return path, including cancellation.
async fn run_inference(
    state: AppState,
    headers: HeaderMap,
    endpoint: &str,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(mut body) = payload.map_err(|e| Error::invalid_request(e.body_text()))?;

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_request("missing \"model\" field"))?;

    if !state.models.is_loaded(&model).await {
        return Err(Error::not_found(format!("model {} is not loaded", model)).into());
    }

    let priority = requested_priority(&state, &headers, &mut body);
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let permit = match state.admission.acquire(priority, None).await {
        Ok(permit) => permit,
        Err(e) => {
            if matches!(e, Error::Busy { .. }) {
                state.metrics.record_rejection(e.reason_code());
            }
            return Err(e.into());
        }
    };
    state.metrics.record_admitted(&priority.to_string());
    debug!(
        request_id = %request_id,
        model = %model,
        priority = %priority,
        waited_ms = permit.waited().as_millis() as u64,
        "Request admitted"
    );

    let request = GenerationRequest {
        model: model.clone(),
        endpoint: endpoint.to_string(),
        body,
        request_id: Some(request_id.clone()),
    };

    let generated = tokio::time::timeout(state.inference_timeout, state.models.runtime().generate(request)).await;
    drop(permit);

    let response = match generated {
        Ok(result) => result?,
        Err(_) => {
            warn!(
                request_id = %request_id,
                model = %model,
                timeout_secs = state.inference_timeout.as_secs(),
                "Inference timed out"
            );
            return Err(Error::timeout(format!(
                "inference exceeded {}s",
                state.inference_timeout.as_secs()
            ))
            .into());
        }
    };

    let mut http_response = Json(response.body).into_response();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        http_response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    Ok(http_response)
}

/// Priority requested in the body; `high` only counts for admin callers
fn requested_priority(state: &AppState, headers: &HeaderMap, body: &mut Value) -> Priority {
    let requested = body
        .as_object_mut()
        .and_then(|obj| obj.remove("priority"))
        .and_then(|v| serde_json::from_value::<Priority>(v).ok())
        .unwrap_or_default();

    match requested {
        Priority::High if !state.auth.is_admin(headers) => {
            debug!("Ignoring high priority from a non-admin caller");
            Priority::Normal
        }
        other => other,
    }
}
