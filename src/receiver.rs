//! HTTP receiver for the log drain
//!
//! `POST /log` takes a batch of framed syslog messages behind HTTP basic
//! auth. Method and credentials are checked by middleware before the body is
//! read, so rejected requests never reach the frame decoder.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State},
    http::{header, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, Config};
use crate::error::{DrainError, Result};
use crate::ingest::{BatchSummary, Ingestor};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ingestor: Arc<Ingestor>,
    pub started_at: Instant,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub tenants: usize,
}

/// HTTP receiver for drain batches
pub struct LogReceiver {
    state: AppState,
}

impl LogReceiver {
    pub fn new(config: Arc<Config>, ingestor: Arc<Ingestor>) -> Self {
        Self {
            state: AppState {
                config,
                ingestor,
                started_at: Instant::now(),
            },
        }
    }

    /// Create the HTTP router
    pub fn create_router(&self) -> Router {
        let server = &self.state.config.server;

        let drain = Router::new()
            .route("/log", any(drain_logs))
            .route("/logs", any(drain_logs))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                require_basic_auth,
            ));

        let middleware = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(server.request_timeout_secs)));

        Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(metrics_handler))
            .merge(drain)
            .with_state(self.state.clone())
            .layer(DefaultBodyLimit::max(server.max_body_size))
            .layer(middleware)
    }
}

/// Rejects anything but an authenticated POST.
async fn require_basic_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    if request.method() != Method::POST {
        return Err(DrainError::MethodNotAllowed("only POST is allowed".to_string()));
    }

    let Some((user, secret)) = basic_credentials(&request) else {
        warn!(uri = %request.uri(), "Drain request without basic credentials");
        return Err(DrainError::AuthenticationRequired("authorization required".to_string()));
    };

    if !credentials_match(&state.config.auth, &user, &secret) {
        warn!(uri = %request.uri(), user = %user, "Drain request with wrong credentials");
        return Err(DrainError::AuthenticationFailed("authorization failed".to_string()));
    }

    Ok(next.run(request).await)
}

/// Decode `Authorization: Basic <base64(user:secret)>`.
fn basic_credentials(request: &Request) -> Option<(String, String)> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, secret) = decoded.split_once(':')?;
    Some((user.to_string(), secret.to_string()))
}

/// Compares digests so the comparison time does not depend on where the inputs differ.
fn credentials_match(expected: &AuthConfig, user: &str, secret: &str) -> bool {
    let user_ok = Sha256::digest(user.as_bytes()) == Sha256::digest(expected.user.as_bytes());
    let secret_ok = Sha256::digest(secret.as_bytes()) == Sha256::digest(expected.secret.as_bytes());
    user_ok & secret_ok
}

/// Drain batch handler
async fn drain_logs(State(state): State<AppState>, body: Bytes) -> Json<BatchSummary> {
    if state.config.logging.debug {
        debug!(bytes = body.len(), body = %String::from_utf8_lossy(&body), "Raw drain batch");
    }

    let summary = state.ingestor.process_batch(body).await;
    if summary.framing_error.is_some() || summary.write_failures > 0 {
        info!(
            frames = summary.frames,
            written = summary.written,
            write_failures = summary.write_failures,
            framing_error = ?summary.framing_error,
            "Drain batch partially processed"
        );
    }
    Json(summary)
}

/// Health check handler
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        tenants: state.ingestor.routes().len(),
    })
}

/// Prometheus metrics handler
async fn metrics_handler(State(state): State<AppState>) -> Result<Response> {
    let body = state.ingestor.metrics().export()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
