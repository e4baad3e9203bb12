//! Web server: axum status API and subscriber stream.
//!
//! Read-only status endpoints (source health, pipeline counters, live entity
//! and session counts) plus the subscriber WebSocket at `/api/v1/stream`.
//! Everything is served from in-memory state.

use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use track_core::gate::StateStore;

use crate::adapter::ProviderAdapter;
use crate::aggregator::FusionAggregator;
use crate::notifier::GeoNotifier;
use crate::pipeline::PipelineStats;

pub mod routes;
pub mod stream;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub adapters: Vec<Arc<dyn ProviderAdapter>>,
    pub aggregators: Vec<Arc<FusionAggregator>>,
    pub stats: Arc<PipelineStats>,
    pub notifier: Arc<GeoNotifier>,
    pub state: Arc<StateStore>,
    pub started_at: Instant,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(routes::api_health))
        .route("/api/v1/sources", get(routes::api_sources))
        .route("/api/v1/stats", get(routes::api_stats))
        .route("/api/v1/stream", get(stream::api_stream))
        .with_state(state)
        .layer(cors)
}

/// Serve the status API until `cancel` fires.
pub async fn serve(state: Arc<AppState>, host: &str, port: u16, cancel: CancellationToken) -> std::io::Result<()> {
    let app = build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("status API listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
