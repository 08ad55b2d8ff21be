//! HTTP surface (spec §6, C3 feeder ingest + C9 read API).
//!
//! Keeps the teacher's axum wiring conventions — `AppState` extracted via
//! `with_state`, request-logging and Sentry-error middleware layered over
//! the router, permissive CORS — and drops the embedded web-UI/sitemap
//! machinery that has no counterpart in this service.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, Request, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::hot_cache::LiveStateCache;
use crate::read_api::{BoundsQuery, ReadApi};
use crate::source_adapters::feeder::{AuthOutcome, FeederAdapter, GovernResult};
use crate::state::NormalizedState;
use crate::state_repository::StateRepository;

#[derive(Clone)]
pub struct AppState {
    pub read_api: Arc<ReadApi>,
    pub feeder_adapter: Arc<FeederAdapter>,
    pub visibility_window: chrono::Duration,
}

// ============================================================================
// Middleware (grounded on the teacher's `request_logging_middleware` /
// `sentry_error_middleware` in the original web.rs)
// ============================================================================

async fn request_logging_middleware(request: Request<axum::body::Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let start_time = Instant::now();

    info!("Started {} {} [{}]", method, path, request_id);

    let response = next.run(request).await;
    let duration = start_time.elapsed();
    let status = response.status();

    info!(
        "Completed {} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        status.as_u16(),
        duration.as_secs_f64() * 1000.0
    );

    response
}

async fn sentry_error_middleware(request: Request<axum::body::Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    if response.status().is_server_error() {
        let status = response.status();
        error!("HTTP {} error on {} {}", status.as_u16(), method, uri);

        sentry::configure_scope(|scope| {
            scope.set_tag("http.method", method.as_str());
            scope.set_tag("http.url", uri.to_string());
            scope.set_tag("http.status_code", status.as_u16().to_string());
        });

        sentry::capture_message(
            &format!("HTTP {} error on {} {}", status.as_u16(), method, uri),
            sentry::Level::Error,
        );
    }

    response
}

// ============================================================================
// GET /states/bounds
// ============================================================================

#[derive(Debug, Deserialize)]
struct BoundsParams {
    lat_min: f64,
    lon_min: f64,
    lat_max: f64,
    lon_max: f64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct BoundsResponse {
    states: Vec<crate::state::StateRecord>,
}

async fn get_states_bounds(
    State(state): State<AppState>,
    Query(params): Query<BoundsParams>,
) -> Response {
    let query = BoundsQuery {
        min_lat: params.lat_min,
        min_lon: params.lon_min,
        max_lat: params.lat_max,
        max_lon: params.lon_max,
    };

    match state.read_api.query_bounds(query, chrono::Utc::now()).await {
        Ok(states) => Json(BoundsResponse { states }).into_response(),
        Err(e) => {
            let message = e.to_string();
            let status = if message.contains("out of range") || message.contains("must not exceed") {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(ErrorBody { error: message })).into_response()
        }
    }
}

// ============================================================================
// POST /ingest/feeder
// ============================================================================

#[derive(Debug, Deserialize)]
struct FeederBatch {
    states: Vec<NormalizedState>,
}

#[derive(Debug, Serialize)]
struct FeederBatchResult {
    enqueued: usize,
    rejected: usize,
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn post_ingest_feeder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(batch): Json<FeederBatch>,
) -> Response {
    let Some(token) = extract_bearer(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(ErrorBody { error: "missing bearer token".to_string() }))
            .into_response();
    };

    let adapter = Arc::clone(&state.feeder_adapter);
    let auth_result = spawn_blocking({
        let adapter = Arc::clone(&adapter);
        move || adapter.authenticate(&token)
    })
    .await;

    let (feeder_id, rate_limit_per_minute) = match auth_result {
        Ok(Ok(AuthOutcome::Authenticated { feeder_id, rate_limit_per_minute })) => {
            (feeder_id, rate_limit_per_minute)
        }
        Ok(Ok(AuthOutcome::Unauthenticated)) => {
            return (StatusCode::UNAUTHORIZED, Json(ErrorBody { error: "invalid feeder token".to_string() }))
                .into_response();
        }
        Ok(Err(e)) => {
            error!(error = %e, "feeder auth lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: "auth lookup failed".to_string() }))
                .into_response();
        }
        Err(join_err) => {
            error!(error = %join_err, "feeder auth task join error");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let now = chrono::Utc::now();
    match adapter.govern(&feeder_id, rate_limit_per_minute as u32, now).await {
        Ok(GovernResult::Allowed) => {}
        Ok(GovernResult::RateLimited { retry_at }) => {
            return rate_limited_response(retry_at, now);
        }
        Ok(GovernResult::BreakerOpen { retry_at }) => {
            return breaker_open_response(retry_at, now);
        }
        Err(e) => {
            error!(error = %e, "feeder governor check failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: "governor check failed".to_string() }))
                .into_response();
        }
    }

    let outcome = adapter.ingest_batch(&feeder_id, batch.states).await;
    (
        StatusCode::ACCEPTED,
        Json(FeederBatchResult { enqueued: outcome.enqueued, rejected: outcome.rejected }),
    )
        .into_response()
}

fn rate_limited_response(retry_at: chrono::DateTime<chrono::Utc>, now: chrono::DateTime<chrono::Utc>) -> Response {
    let mut headers = HeaderMap::new();
    let retry_after_secs = (retry_at - now).num_seconds().max(0);
    if let Ok(value) = retry_after_secs.to_string().parse() {
        headers.insert("retry-after", value);
    }
    (StatusCode::TOO_MANY_REQUESTS, headers, Json(ErrorBody { error: "rate limit exceeded".to_string() })).into_response()
}

fn breaker_open_response(retry_at: chrono::DateTime<chrono::Utc>, now: chrono::DateTime<chrono::Utc>) -> Response {
    let mut headers = HeaderMap::new();
    let retry_after_secs = (retry_at - now).num_seconds().max(0);
    if let Ok(value) = retry_after_secs.to_string().parse() {
        headers.insert("retry-after", value);
    }
    (StatusCode::SERVICE_UNAVAILABLE, headers, Json(ErrorBody { error: "circuit breaker open".to_string() })).into_response()
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ingest/feeder", post(post_ingest_feeder))
        .route("/states/bounds", get(get_states_bounds))
        .route("/healthz", get(health))
        .with_state(state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(middleware::from_fn(sentry_error_middleware))
        .layer(CorsLayer::permissive())
}

pub async fn start_web_server(
    interface: String,
    port: u16,
    cache: Arc<LiveStateCache>,
    repository: Arc<StateRepository>,
    feeder_adapter: Arc<FeederAdapter>,
    config: &Config,
) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "web-server");
    });
    info!("Starting web server on {}:{}", interface, port);

    let read_api = Arc::new(ReadApi::new(
        cache,
        repository,
        config.min_results_before_db_fallback,
        config.visibility_window,
    ));

    let app_state = AppState {
        read_api,
        feeder_adapter,
        visibility_window: config.visibility_window,
    };

    let app = build_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", interface, port)).await?;
    info!("Web server listening on http://{}:{}", interface, port);

    axum::serve(listener, app).await?;

    Ok(())
}
