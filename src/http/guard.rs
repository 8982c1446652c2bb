//! Rate limit guards for axum handlers.
//!
//! A guard wraps a handler (or a whole router) with
//! [`axum::middleware::from_fn_with_state`]. Admitted requests get
//! `X-RateLimit-*` headers; rejected ones get a 429 envelope and never
//! reach the handler.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, warn};

use super::ApiResponse;
use crate::error::TurnstileError;
use crate::ratelimit::{
    KeySource, RateLimitStatus, RateLimiter, RateLimiterRegistry, TrustedProxies,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// State for a guard bound to one limiter.
#[derive(Clone)]
pub struct GuardState {
    limiter: Arc<RateLimiter>,
    key: KeySource,
    proxies: TrustedProxies,
}

impl GuardState {
    /// Guard requests with `limiter`, identifying callers by `key`.
    pub fn new(limiter: Arc<RateLimiter>, key: KeySource) -> Self {
        Self {
            limiter,
            key,
            proxies: TrustedProxies::none(),
        }
    }

    /// Believe forwarding headers from these proxies.
    pub fn with_trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.proxies = proxies;
        self
    }
}

/// Guard a handler with a single limiter.
///
/// ```ignore
/// let app = Router::new()
///     .route("/login", post(login))
///     .layer(from_fn_with_state(GuardState::new(auth, KeySource::Ip), policy_guard));
/// ```
pub async fn policy_guard(State(guard): State<GuardState>, request: Request, next: Next) -> Response {
    enforce(&guard.limiter, &guard.key, &guard.proxies, request, next).await
}

/// Guard every request whose path matches a configured route rule.
///
/// Requests outside every rule pass through untouched.
pub async fn route_guard(
    State(registry): State<Arc<RateLimiterRegistry>>,
    request: Request,
    next: Next,
) -> Response {
    match registry.resolve(request.uri().path()) {
        Some((limiter, key)) => {
            enforce(&limiter, &key, registry.trusted_proxies(), request, next).await
        }
        None => next.run(request).await,
    }
}

async fn enforce(
    limiter: &RateLimiter,
    key: &KeySource,
    proxies: &TrustedProxies,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identifier = key.identify(request.headers(), peer, proxies);

    match limiter.check(&identifier) {
        Ok(status) => {
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), &status);
            response
        }
        Err(err) => {
            debug!(
                policy = %limiter.name(),
                identifier = %identifier,
                path = %request.uri().path(),
                "Request rejected by rate limit"
            );
            err.into_response()
        }
    }
}

/// Set the `X-RateLimit-*` headers from a status.
pub fn apply_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(status.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(status.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(status.reset_at_secs()));
}

impl IntoResponse for TurnstileError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        match self {
            TurnstileError::RateLimitExceeded {
                limit,
                reset_at_ms,
                retry_after_ms,
                ..
            } => {
                let retry_after_secs = retry_after_ms.div_ceil(1000).max(1);
                let body = ApiResponse::<()>::rate_limited(retry_after_secs);

                let mut response = (status, Json(body)).into_response();
                let headers = response.headers_mut();
                apply_headers(
                    headers,
                    &RateLimitStatus {
                        limit,
                        remaining: 0,
                        reset_at_ms,
                    },
                );
                headers.insert(
                    axum::http::header::RETRY_AFTER,
                    HeaderValue::from(retry_after_secs),
                );
                response
            }
            TurnstileError::InvalidCost { .. } => {
                (status, Json(ApiResponse::<()>::error(self.to_string()))).into_response()
            }
            other => {
                warn!(error = %other, "Request failed");
                (status, Json(ApiResponse::<()>::error("Internal server error"))).into_response()
            }
        }
    }
}
