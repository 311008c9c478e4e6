//! Health check endpoint

use std::collections::BTreeMap;

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the store cannot be read
    pub status: String,
    /// Module name ("saxscore-worker")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Job ids waiting in the in-memory queue
    pub queue_depth: usize,
    /// Job count per status
    pub jobs: BTreeMap<String, i64>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let (status, jobs) = match saxscore_common::db::jobs::count_by_status(&state.db).await {
        Ok(counts) => (
            "ok",
            counts
                .into_iter()
                .map(|(status, n)| (status.as_str().to_string(), n))
                .collect(),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read job counts");
            ("degraded", BTreeMap::new())
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        module: "saxscore-worker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        queue_depth: state.queue.len(),
        jobs,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
