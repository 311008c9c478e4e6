//! saxscore-worker library interface
//!
//! Job queue, worker loop, pipeline orchestrator and stages, analysis
//! backend adapters, export encoders, transpose and the HTTP API. The
//! binary in `main.rs` wires these together; integration tests use them
//! directly.

pub mod admission;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod formats;
pub mod pipeline;
pub mod queue;
pub mod transpose;
pub mod worker;

pub use crate::error::{ApiError, ApiResult};

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use saxscore_common::events::EventBus;
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

use crate::queue::JobQueue;
use crate::transpose::Transposer;

/// Default upload limit when none is configured
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    /// Shared with the worker loop
    pub queue: Arc<JobQueue>,
    pub event_bus: EventBus,
    pub transposer: Transposer,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(db: SqlitePool, queue: Arc<JobQueue>, event_bus: EventBus, transposer: Transposer) -> Self {
        Self {
            db,
            queue,
            event_bus,
            transposer,
            startup_time: Utc::now(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_upload_bytes);

    Router::new()
        .merge(api::transcription_routes())
        .merge(api::health_routes())
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
