//! HTTP rendering of lmx errors

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error returned from handlers and middleware
///
/// Renders `{"error": {"code", "message"}}` with the status from
/// [`lmx_core::Error::to_http_status`] and a `Retry-After` header when the
/// error carries a retry hint.
#[derive(Debug)]
pub struct ApiError(pub lmx_core::Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.0.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn inner(&self) -> &lmx_core::Error {
        &self.0
    }
}

impl<E> From<E> for ApiError
where
    E: Into<lmx_core::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "code": self.0.reason_code(),
                "message": self.0.to_string(),
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = self.0.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
