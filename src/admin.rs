//! Admin and control surface.
//!
//! Serves health, the config dump, the Prometheus render and the live
//! update endpoints (`update_listener`, `update_cluster`, `update_route`).
//! Rejected updates return the validation error and leave the running
//! configuration untouched.

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::{AdminConfig, ClusterConfig, ListenerConfig, RouterConfig, StreamFilterConfig};
use crate::error::{ProxyError, Result};
use crate::server::Server;

pub struct AdminServer {
    config: AdminConfig,
    server: Arc<Server>,
    prometheus: Option<PrometheusHandle>,
}

#[derive(Clone)]
struct AdminState {
    server: Arc<Server>,
    prometheus: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize)]
struct UpdateListenerRequest {
    listener: ListenerConfig,
    #[serde(default)]
    stream_filters: Option<Vec<StreamFilterConfig>>,
}

#[derive(Debug, Deserialize)]
struct UpdateClusterRequest {
    clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Deserialize)]
struct UpdateRouteRequest {
    routers: Vec<RouterConfig>,
}

impl AdminServer {
    pub fn new(
        config: &AdminConfig,
        server: Arc<Server>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config: config.clone(),
            server,
            prometheus,
        }
    }

    /// Start the admin server; runs until the process exits.
    pub async fn start(&self) -> Result<()> {
        let state = AdminState {
            server: self.server.clone(),
            prometheus: self.prometheus.clone(),
        };

        let app = Router::new()
            .route("/health", get(health))
            .route("/api/v1/config_dump", get(config_dump))
            .route("/api/v1/update_listener", post(update_listener))
            .route("/api/v1/update_cluster", post(update_cluster))
            .route("/api/v1/update_route", post(update_route))
            .route("/metrics", get(render_metrics))
            .with_state(state);

        let addr = format!("127.0.0.1:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Listener(format!("admin bind {}: {}", addr, e)))?;
        info!(addr = %addr, "admin server listening");

        axum::serve(listener, app)
            .await
            .map_err(|e| ProxyError::Listener(format!("admin server: {}", e)))?;
        Ok(())
    }
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn config_dump(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.server.config_dump())
}

async fn render_metrics(State(state): State<AdminState>) -> impl IntoResponse {
    match state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

async fn update_listener(
    State(state): State<AdminState>,
    Json(req): Json<UpdateListenerRequest>,
) -> impl IntoResponse {
    match state
        .server
        .update_listener(req.listener, req.stream_filters)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))),
        Err(e) => error_response(e),
    }
}

async fn update_cluster(
    State(state): State<AdminState>,
    Json(req): Json<UpdateClusterRequest>,
) -> impl IntoResponse {
    match state.server.apply_clusters(req.clusters) {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))),
        Err(e) => error_response(e),
    }
}

async fn update_route(
    State(state): State<AdminState>,
    Json(req): Json<UpdateRouteRequest>,
) -> impl IntoResponse {
    match state.server.apply_routes(req.routers) {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))),
        Err(e) => error_response(e),
    }
}

fn error_response(e: ProxyError) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "error": e.to_string()})),
    )
}
