//! Status API route handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use track_core::types::EntityClass;

use crate::adapter::SourceStatus;
use crate::web::AppState;

/// `ok` while every source is healthy, `degraded` otherwise. Always 200.
pub async fn api_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let total = state.adapters.len();
    let healthy = state.adapters.iter().filter(|a| a.is_healthy()).count();
    let status = if healthy == total { "ok" } else { "degraded" };

    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "sources_total": total,
            "sources_healthy": healthy,
            "uptime_secs": state.started_at.elapsed().as_secs(),
        })),
    )
}

pub async fn api_sources(State(state): State<Arc<AppState>>) -> Json<Vec<SourceStatus>> {
    let mut sources: Vec<SourceStatus> = state.adapters.iter().map(|a| a.status()).collect();
    sources.sort_by(|a, b| a.name.cmp(&b.name));
    Json(sources)
}

pub async fn api_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "pipeline": state.stats.snapshot(),
        "entities": {
            "aircraft": state.state.count_by_class(EntityClass::Aircraft),
            "vessel": state.state.count_by_class(EntityClass::Vessel),
        },
        "buffered": state
            .aggregators
            .iter()
            .map(|a| (a.class.as_str(), a.buffered()))
            .collect::<std::collections::BTreeMap<_, _>>(),
        "sessions": state.notifier.session_count(),
        "areas": state.notifier.area_count(),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
