use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use th_core::config::TerminalConfig;
use th_session::{AdmissionController, SessionConfig};
use th_telemetry::metrics::global_metrics;
use th_telemetry::middleware::metrics_middleware;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::terminal_ws;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Shared by every request handler and every terminal session.
pub struct ApiState {
    pub session_config: Arc<SessionConfig>,
    pub admission: Arc<AdmissionController>,
}

impl ApiState {
    pub fn new(config: &TerminalConfig) -> Self {
        Self {
            session_config: Arc::new(SessionConfig::from(config)),
            admission: Arc::new(AdmissionController::new(config.max_concurrent)),
        }
    }

    pub fn from_parts(session_config: SessionConfig, admission: Arc<AdmissionController>) -> Self {
        Self {
            session_config: Arc::new(session_config),
            admission,
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the router with the info endpoints and the terminal WebSocket.
pub fn api_router(state: Arc<ApiState>) -> Router {
    let cors = cors_layer(&state.session_config.allowed_origins);
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/apps", get(list_apps))
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))
        .route("/ws", get(terminal_ws::terminal_ws))
        .layer(axum_middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(_) if origin == "*" => {
                warn!("wildcard origin is not supported, skipping");
                None
            }
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "skipping origin that is not a valid header value");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::ACCEPT])
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub status: &'static str,
    pub endpoints: BTreeMap<&'static str, &'static str>,
}

/// GET / -- service descriptor.
async fn get_root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "Terminal Backend",
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
        endpoints: BTreeMap::from([
            ("health", "/health"),
            ("apps", "/apps"),
            ("metrics", "/metrics"),
            ("websocket", "/ws"),
        ]),
    })
}

/// GET /health
async fn get_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
pub struct AppsResponse {
    pub apps: BTreeMap<String, String>,
    pub directory: String,
    pub running: usize,
    pub max_concurrent: usize,
}

/// GET /apps -- the whitelist and current admission usage.
async fn list_apps(State(state): State<Arc<ApiState>>) -> Json<AppsResponse> {
    Json(AppsResponse {
        apps: state.session_config.allowed_apps.clone(),
        directory: state.session_config.apps_directory.display().to_string(),
        running: state.admission.current_jobs(),
        max_concurrent: state.admission.max_concurrent(),
    })
}

/// GET /metrics -- Prometheus text format.
async fn get_metrics_prometheus() -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        global_metrics().export_prometheus(),
    )
}

/// GET /metrics/json
async fn get_metrics_json() -> Json<serde_json::Value> {
    Json(global_metrics().export_json())
}
