//! Request logging, API key auth and rate limiting.

use crate::error::ApiError;
use crate::server::ServerState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use neverdown_common::ErrorCode;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

/// Log method, path, status and latency for every request.
pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Bearer-token check for mutating API routes. Disabled when no key is
/// configured (development mode).
pub async fn require_api_key(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    let key = &state.settings.api_key;
    if key.is_empty() || request.method() == Method::GET {
        return next.run(request).await;
    }

    let authorized = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == key.expose());

    if authorized {
        next.run(request).await
    } else {
        ApiError::new(ErrorCode::UnauthorizedRepo, "invalid or missing API key").into_response()
    }
}

const RATE_WINDOW: Duration = Duration::from_secs(60);
const RATE_LIMIT: u32 = 120;

/// Fixed-window per-IP rate limiter.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    /// Record one request; `false` means the caller is over the limit.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let mut windows = self.windows.lock().expect("rate limiter lock");
        let now = Instant::now();
        let entry = windows.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) > RATE_WINDOW {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 <= RATE_LIMIT
    }
}

pub async fn rate_limit(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if state.rate_limiter.allow(addr.ip()) {
        next.run(request).await
    } else {
        ApiError::new(ErrorCode::CircuitBreakerOpen, "rate limit exceeded").into_response()
    }
}

/// Remembers recent webhook delivery ids so a replayed payload does not
/// create a duplicate incident. Bounded FIFO; oldest ids fall off.
#[derive(Default)]
pub struct DeliveryLedger {
    seen: Mutex<std::collections::VecDeque<String>>,
}

const DELIVERY_CAPACITY: usize = 1024;

impl DeliveryLedger {
    /// Record a delivery id; `false` means it was already seen.
    pub fn record(&self, delivery_id: &str) -> bool {
        let mut seen = self.seen.lock().expect("delivery ledger lock");
        if seen.iter().any(|id| id == delivery_id) {
            return false;
        }
        if seen.len() >= DELIVERY_CAPACITY {
            seen.pop_front();
        }
        seen.push_back(delivery_id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_ledger_detects_replay() {
        let ledger = DeliveryLedger::default();
        assert!(ledger.record("delivery-1"));
        assert!(!ledger.record("delivery-1"));
        assert!(ledger.record("delivery-2"));
    }

    #[test]
    fn test_delivery_ledger_is_bounded() {
        let ledger = DeliveryLedger::default();
        for i in 0..(DELIVERY_CAPACITY + 10) {
            assert!(ledger.record(&format!("d{i}")));
        }
        // The earliest entry has been evicted and reads as new again
        assert!(ledger.record("d0"));
    }

    #[test]
    fn test_rate_limiter_allows_up_to_limit() {
        let limiter = RateLimiter::default();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..RATE_LIMIT {
            assert!(limiter.allow(ip));
        }
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn test_rate_limiter_tracks_ips_separately() {
        let limiter = RateLimiter::default();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        for _ in 0..=RATE_LIMIT {
            limiter.allow(a);
        }
        assert!(!limiter.allow(a));
        assert!(limiter.allow(b));
    }
}
