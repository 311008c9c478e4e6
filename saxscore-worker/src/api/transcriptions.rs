//! Transcription API handlers
//!
//! POST /transcriptions, GET /transcriptions/:id,
//! GET /transcriptions/:id/exports/:tag, POST /transcriptions/:id/transpose,
//! POST /transcriptions/:id/retry

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use saxscore_common::db;
use saxscore_common::db::exports::ArtifactSummary;
use saxscore_common::{ExportFormat, Instrument, JobStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::{admission, AppState};

/// POST /transcriptions query parameters
#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub file_name: String,
    /// Instrument hint; `auto` when omitted
    #[serde(default)]
    pub instrument: Option<String>,
}

/// POST /transcriptions and POST /transcriptions/:id/retry response
#[derive(Debug, Serialize)]
pub struct AdmitResponse {
    pub id: Uuid,
    pub status: JobStatus,
}

/// GET /transcriptions/:id response
#[derive(Debug, Serialize)]
pub struct TranscriptionResponse {
    pub id: Uuid,
    pub file_name: String,
    pub instrument_hint: Instrument,
    pub status: JobStatus,
    pub key_signature: Option<String>,
    pub meter: Option<String>,
    pub tempo_bpm: Option<f64>,
    pub resolved_instrument: Option<Instrument>,
    pub note_count: i64,
    pub artifacts: Vec<ArtifactSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// POST /transcriptions/:id/transpose request
#[derive(Debug, Deserialize)]
pub struct TransposeRequest {
    pub target: String,
}

/// POST /transcriptions/:id/transpose response
#[derive(Debug, Serialize)]
pub struct TransposeResponse {
    pub id: Uuid,
    pub format: String,
    pub target: Instrument,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midi_format: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// POST /transcriptions?file_name=..&instrument=..
///
/// Raw audio in the body. Returns 202 Accepted with the job id.
pub async fn create_transcription(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<AdmitResponse>)> {
    let hint = match params.instrument.as_deref() {
        None | Some("") => Instrument::Auto,
        Some(value) => parse_instrument(value)?,
    };

    let job = admission::admit(&state.db, &state.queue, &params.file_name, hint, body.to_vec()).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AdmitResponse {
            id: job.id,
            status: job.status,
        }),
    ))
}

/// GET /transcriptions/:id
pub async fn get_transcription(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<TranscriptionResponse>> {
    let job = db::jobs::load_job(&state.db, job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Transcription not found: {}", job_id)))?;

    let note_count = match job.notes_run_id {
        Some(run_id) => db::notes::count_notes(&state.db, job_id, Some(run_id)).await?,
        None => 0,
    };
    let artifacts = db::exports::list_artifacts(&state.db, job_id).await?;

    Ok(Json(TranscriptionResponse {
        id: job.id,
        file_name: job.file_name,
        instrument_hint: job.instrument_hint,
        status: job.status,
        key_signature: job.key_signature,
        meter: job.meter,
        tempo_bpm: job.tempo_bpm,
        resolved_instrument: job.resolved_instrument,
        note_count,
        artifacts,
        created_at: job.created_at,
        updated_at: job.updated_at,
    }))
}

/// GET /transcriptions/:id/exports/:tag
///
/// Latest artifact for the tag, with the format's content type.
pub async fn download_export(
    State(state): State<AppState>,
    Path((job_id, tag)): Path<(Uuid, String)>,
) -> ApiResult<Response> {
    let (format, _) = ExportFormat::parse_tag(&tag)?;

    if db::jobs::load_job(&state.db, job_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Transcription not found: {}", job_id)));
    }

    let artifact = db::exports::latest_artifact(&state.db, job_id, &tag)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No {} export for transcription {}", tag, job_id)))?;

    let disposition = format!("attachment; filename=\"{}.{}\"", job_id, file_extension(format));
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.content,
    )
        .into_response())
}

/// POST /transcriptions/:id/transpose
///
/// Returns 201 Created with the new artifact.
pub async fn transpose_transcription(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<TransposeRequest>,
) -> ApiResult<(StatusCode, Json<TransposeResponse>)> {
    let target = parse_instrument(&request.target)?;
    let result = state.transposer.transpose(job_id, target).await?;

    Ok((
        StatusCode::CREATED,
        Json(TransposeResponse {
            id: result.artifact_id,
            format: result.format,
            target: result.target,
            midi_format: result.midi_format,
            created_at: result.created_at,
        }),
    ))
}

/// POST /transcriptions/:id/retry
///
/// Re-admit a finished job. 409 while it is still queued or processing.
pub async fn retry_transcription(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<AdmitResponse>)> {
    let job = admission::readmit(&state.db, &state.queue, &state.event_bus, job_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AdmitResponse {
            id: job.id,
            status: job.status,
        }),
    ))
}

fn parse_instrument(value: &str) -> ApiResult<Instrument> {
    value
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Unknown instrument: {}", value)))
}

fn file_extension(format: ExportFormat) -> &'static str {
    match format {
        ExportFormat::MusicXml => "musicxml",
        ExportFormat::Json => "json",
        ExportFormat::Midi => "mid",
    }
}

/// Build transcription routes
pub fn transcription_routes() -> Router<AppState> {
    Router::new()
        .route("/transcriptions", post(create_transcription))
        .route("/transcriptions/:id", get(get_transcription))
        .route("/transcriptions/:id/exports/:tag", get(download_export))
        .route("/transcriptions/:id/transpose", post(transpose_transcription))
        .route("/transcriptions/:id/retry", post(retry_transcription))
}
