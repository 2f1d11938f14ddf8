//! Per-client token-bucket rate limiting

use crate::error::ApiError;
use crate::server::AppState;
use crate::is_probe_path;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use lmx_core::{Error, RateLimitConfig, RateLimitRule};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Route groups with independent budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteGroup {
    Inference,
    Admin,
}

impl RouteGroup {
    /// Group for a request path, `None` for exempt probe paths
    pub fn classify(path: &str) -> Option<Self> {
        if is_probe_path(path) {
            None
        } else if path == "/admin" || path.starts_with("/admin/") {
            Some(RouteGroup::Admin)
        } else {
            Some(RouteGroup::Inference)
        }
    }
}

/// Token bucket holding between zero and `capacity` tokens
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    pub fn new(rule: &RateLimitRule, now: Instant) -> Self {
        let capacity = f64::from(rule.burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: rule.refill_per_second(),
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or return the seconds until one is available
    pub fn try_take(&mut self, now: Instant) -> Result<(), u64> {
        self.refill(now);
        self.last_used = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let secs = (deficit / self.refill_per_sec).ceil() as u64;
            Err(secs.max(1))
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Full and unused for at least `idle`
    fn is_idle(&mut self, now: Instant, idle: Duration) -> bool {
        self.refill(now);
        now.saturating_duration_since(self.last_used) >= idle && self.tokens >= self.capacity
    }
}

/// Buckets keyed by route group and client address
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    inference: RateLimitRule,
    admin: RateLimitRule,
    idle_eviction: Duration,
    buckets: DashMap<(RouteGroup, String), TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            inference: config.inference,
            admin: config.admin,
            idle_eviction: Duration::from_secs(config.idle_eviction_secs),
            buckets: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn rule(&self, group: RouteGroup) -> &RateLimitRule {
        match group {
            RouteGroup::Inference => &self.inference,
            RouteGroup::Admin => &self.admin,
        }
    }

    pub fn check(&self, group: RouteGroup, client: &str) -> lmx_core::Result<()> {
        self.check_at(group, client, Instant::now())
    }

    pub fn check_at(&self, group: RouteGroup, client: &str, now: Instant) -> lmx_core::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let rule = self.rule(group);
        let mut bucket = self
            .buckets
            .entry((group, client.to_string()))
            .or_insert_with(|| TokenBucket::new(rule, now));

        bucket.try_take(now).map_err(|retry_after_secs| {
            debug!(client, group = ?group, retry_after_secs, "Rate limit exceeded");
            Error::rate_limited(retry_after_secs)
        })
    }

    /// Drop buckets that are full and idle; returns how many were removed
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }

    pub fn prune_idle_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        let idle = self.idle_eviction;
        self.buckets.retain(|_, bucket| !bucket.is_idle(now, idle));
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Pruned idle rate-limit buckets");
        }
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn idle_eviction(&self) -> Duration {
        self.idle_eviction
    }
}

/// Client identity: the peer address, `"unknown"` when not recorded
pub fn client_identity(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware enforcing the per-client budget of the request's route group
pub async fn rate_limit_requests(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(group) = RouteGroup::classify(request.uri().path()) else {
        return Ok(next.run(request).await);
    };

    let client = client_identity(&request);
    if let Err(e) = state.rate_limiter.check(group, &client) {
        state.metrics.record_rejection(e.reason_code());
        return Err(e.into());
    }

    Ok(next.run(request).await)
}
