//! Admin-key authentication for administrative routes

use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use lmx_core::config::SecurityConfig;
use lmx_core::Error;
use tracing::{debug, warn};

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Checks the admin key carried by a request
///
/// Accepts `X-Admin-Key: <key>` or `Authorization: Bearer <key>`. With no
/// key configured every caller is treated as an administrator.
#[derive(Clone)]
pub struct AdminAuth {
    key: Option<String>,
}

impl std::fmt::Debug for AdminAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAuth")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl AdminAuth {
    pub fn new(key: Option<String>) -> Self {
        let key = key.filter(|k| !k.is_empty());
        Self { key }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        if matches!(config.admin_key.as_deref(), Some("")) {
            warn!("Empty admin key configured, treating it as unset");
        }
        Self::new(config.admin_key.clone())
    }

    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// True when the headers carry the admin key, or auth is disabled
    pub fn is_admin(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.key else {
            return true;
        };
        presented_key(headers)
            .map(|presented| constant_time_eq(presented.as_bytes(), expected.as_bytes()))
            .unwrap_or(false)
    }

    pub fn authorize(&self, headers: &HeaderMap) -> lmx_core::Result<()> {
        if self.is_admin(headers) {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(value.trim());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware guarding administrative routes
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Err(e) = state.auth.authorize(request.headers()) {
        debug!(path = %request.uri().path(), "Rejected unauthenticated admin request");
        state.metrics.record_rejection(e.reason_code());
        return Err(e.into());
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_header_forms() {
        let auth = AdminAuth::new(Some("s3cret".to_string()));
        assert!(auth.is_admin(&headers("x-admin-key", "s3cret")));
        assert!(auth.is_admin(&headers("authorization", "Bearer s3cret")));
        assert!(!auth.is_admin(&headers("x-admin-key", "s3cre")));
        assert!(!auth.is_admin(&headers("authorization", "Basic s3cret")));
        assert!(!auth.is_admin(&HeaderMap::new()));
    }

    #[test]
    fn test_unauthorized_error() {
        let auth = AdminAuth::new(Some("k".to_string()));
        let err = auth.authorize(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.to_http_status(), 403);
        assert_eq!(err.to_string(), "Invalid or missing admin key");
    }

    #[test]
    fn test_disabled_auth_admits_everyone() {
        let auth = AdminAuth::from_config(&SecurityConfig {
            admin_key: Some(String::new()),
        });
        assert!(!auth.is_enabled());
        assert!(auth.authorize(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
