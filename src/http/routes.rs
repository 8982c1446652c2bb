//! Service routes for inspecting and consuming quotas.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::guard::{apply_headers, route_guard};
use super::ApiResponse;
use crate::ratelimit::{KeySource, RateLimitStatus, RateLimiter, RateLimiterRegistry, Strategy};

/// Shared state for the service routes.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RateLimiterRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<RateLimiterRegistry>) -> Self {
        Self { registry }
    }
}

/// Build the service router with route guards applied.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ratelimit/policies", get(list_policies))
        .route("/api/ratelimit/status", get(quota_status))
        .route("/api/ratelimit/check", post(quota_check))
        .layer(from_fn_with_state(state.registry.clone(), route_guard))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct QuotaQuery {
    policy: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default = "default_cost")]
    cost: u64,
}

fn default_cost() -> u64 {
    1
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaView {
    policy: String,
    strategy: Strategy,
    identifier: String,
    #[serde(flatten)]
    status: RateLimitStatus,
    reset_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyView {
    name: String,
    strategy: Strategy,
    tracked: usize,
}

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<ApiResponse<Health>> {
    Json(ApiResponse::ok(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_policies(State(state): State<AppState>) -> Json<ApiResponse<Vec<PolicyView>>> {
    let policies = state
        .registry
        .names()
        .into_iter()
        .filter_map(|name| state.registry.get(&name))
        .map(|limiter| PolicyView {
            name: limiter.name().to_string(),
            strategy: limiter.strategy(),
            tracked: limiter.tracked(),
        })
        .collect();
    Json(ApiResponse::ok(policies))
}

/// Read-only view of the caller's quota under a policy.
#[instrument(skip_all, fields(policy = %query.policy))]
async fn quota_status(
    State(state): State<AppState>,
    Query(query): Query<QuotaQuery>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let (limiter, identifier) = match resolve(&state, &query, &headers, connect) {
        Ok(found) => found,
        Err(response) => return response,
    };

    let status = limiter.status(&identifier);
    Json(ApiResponse::ok(view(&limiter, identifier, status))).into_response()
}

/// Consume `cost` units of the caller's quota under a policy.
#[instrument(skip_all, fields(policy = %query.policy, cost = query.cost))]
async fn quota_check(
    State(state): State<AppState>,
    Query(query): Query<QuotaQuery>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let (limiter, identifier) = match resolve(&state, &query, &headers, connect) {
        Ok(found) => found,
        Err(response) => return response,
    };

    match limiter.check_cost(&identifier, query.cost) {
        Ok(status) => {
            let body = ApiResponse::ok(view(&limiter, identifier, status));
            let mut response = Json(body).into_response();
            apply_headers(response.headers_mut(), &status);
            response
        }
        Err(err) => err.into_response(),
    }
}

fn resolve(
    state: &AppState,
    query: &QuotaQuery,
    headers: &HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Result<(Arc<RateLimiter>, String), Response> {
    let limiter = state.registry.get(&query.policy).ok_or_else(|| {
        let body = ApiResponse::<()>::error(format!("Unknown policy `{}`", query.policy));
        (StatusCode::NOT_FOUND, Json(body)).into_response()
    })?;

    let peer = connect.map(|ConnectInfo(addr)| addr);
    let proxies = state.registry.trusted_proxies();

    // Only a trusted proxy may ask for a key other than the caller's own address.
    let key = match &query.key {
        Some(_) if !proxies.trusts(peer) => {
            let body = ApiResponse::<()>::error("Key selection requires a trusted proxy");
            return Err((StatusCode::FORBIDDEN, Json(body)).into_response());
        }
        Some(raw) => KeySource::try_from(raw.clone()).map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(ApiResponse::<()>::error(e))).into_response()
        })?,
        None => KeySource::Ip,
    };

    let identifier = key.identify(headers, peer, proxies);
    Ok((limiter, identifier))
}

fn view(limiter: &RateLimiter, identifier: String, status: RateLimitStatus) -> QuotaView {
    QuotaView {
        policy: limiter.name().to_string(),
        strategy: limiter.strategy(),
        identifier,
        status,
        reset_at: status.reset_at().to_rfc3339(),
    }
}
