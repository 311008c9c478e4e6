//! Pipeline orchestrator
//!
//! Runs one job through its stages, in order:
//!
//! SEPARATION → DETECTION → EXPORT
//!
//! Each stage commits its own results before the next starts, so a failed
//! run can leave an isolated blob or a note set behind. Nothing is rolled
//! back. The cancellation token is checked between stages.

mod detection;
mod export;
mod separation;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use saxscore_common::db;
use saxscore_common::events::{EventBus, JobEvent, Stage};
use saxscore_common::models::Job;
use saxscore_common::{ExportFormat, JobStatus};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{AnalysisBackend, BackendError};
use crate::formats::FormatError;

/// What a stage can fail on
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] saxscore_common::Error),

    #[error(transparent)]
    Format(#[from] FormatError),

    /// A record the stage reads was not there
    #[error("Missing input: {0}")]
    MissingInput(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Separation failed: {0}")]
    Separation(#[source] StageError),

    #[error("Detection failed: {0}")]
    Detection(#[source] StageError),

    #[error("Export failed: {0}")]
    Export(#[source] StageError),

    /// Shutdown requested between stages
    #[error("Run cancelled before {0}")]
    Cancelled(Stage),

    /// Every stage succeeded but the run produced no artifact
    #[error("Run produced no export artifacts")]
    NoArtifacts,

    /// The job was moved out of `processing` while the run was in flight
    #[error("Job left processing before the run finished")]
    NotProcessing,

    #[error("Store error: {0}")]
    Store(#[from] saxscore_common::Error),
}

impl PipelineError {
    fn stage(stage: Stage, error: StageError) -> Self {
        match stage {
            Stage::Separation => PipelineError::Separation(error),
            Stage::Detection => PipelineError::Detection(error),
            Stage::Export => PipelineError::Export(error),
        }
    }

    /// True when the backend was the cause (including timeouts)
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::Separation(StageError::Backend(_))
                | PipelineError::Detection(StageError::Backend(_))
                | PipelineError::Export(StageError::Backend(_))
        )
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Formats rendered by the export stage, in order
    pub export_formats: Vec<ExportFormat>,
    /// Limit on each backend call; `None` waits indefinitely
    pub stage_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            export_formats: vec![ExportFormat::MusicXml, ExportFormat::Json],
            stage_timeout: None,
        }
    }
}

/// Summary of a successful run
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub run_id: Uuid,
    pub note_count: usize,
    /// Artifact tags written by the export stage
    pub artifacts: Vec<String>,
    pub elapsed_ms: u64,
}

/// Shared state handed to each stage
pub(crate) struct StageContext<'a> {
    pub db: &'a SqlitePool,
    pub backend: &'a dyn AnalysisBackend,
    pub events: &'a EventBus,
    pub config: &'a PipelineConfig,
    pub job: &'a Job,
    pub run_id: Uuid,
}

impl StageContext<'_> {
    /// Await a backend call under the configured stage timeout
    ///
    /// Dropping the call on expiry kills a spawned backend process.
    pub async fn invoke<T, F>(&self, call: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        with_timeout(self.config.stage_timeout, call).await
    }
}

pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, call: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| BackendError::Timeout(limit))?,
        None => call.await,
    }
}

/// Runs the stages for one job
pub struct Orchestrator {
    db: SqlitePool,
    backend: Arc<dyn AnalysisBackend>,
    events: EventBus,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(db: SqlitePool, backend: Arc<dyn AnalysisBackend>, events: EventBus, config: PipelineConfig) -> Self {
        Self {
            db,
            backend,
            events,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage for `job`, which the caller has already moved to `processing`
    ///
    /// On success the job is marked `done`. On error the job is left in
    /// `processing`; the caller decides how to record the failure.
    pub async fn run(&self, job: &Job, cancel_token: &CancellationToken) -> Result<PipelineOutcome, PipelineError> {
        let started = Instant::now();
        let ctx = StageContext {
            db: &self.db,
            backend: self.backend.as_ref(),
            events: &self.events,
            config: &self.config,
            job,
            run_id: Uuid::new_v4(),
        };

        tracing::info!(
            job_id = %job.id,
            run_id = %ctx.run_id,
            backend = self.backend.name(),
            hint = %job.instrument_hint,
            "Starting pipeline run"
        );

        // Stage 1: SEPARATION
        let isolated = self
            .stage(&ctx, Stage::Separation, cancel_token, separation::run(&ctx))
            .await?;

        // Stage 2: DETECTION
        let detected = self
            .stage(&ctx, Stage::Detection, cancel_token, detection::run(&ctx, &isolated))
            .await?;

        // Stage 3: EXPORT
        let artifacts = self
            .stage(&ctx, Stage::Export, cancel_token, export::run(&ctx, &detected))
            .await?;

        if db::exports::count_artifacts(&self.db, job.id, Some(ctx.run_id)).await? < 1 {
            return Err(PipelineError::NoArtifacts);
        }

        if !set_status(&self.db, &self.events, job.id, JobStatus::Processing, JobStatus::Done).await? {
            tracing::warn!(job_id = %job.id, run_id = %ctx.run_id, "Job left processing during the run, not marking done");
            return Err(PipelineError::NotProcessing);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            job_id = %job.id,
            run_id = %ctx.run_id,
            notes = detected.notes.len(),
            artifacts = artifacts.len(),
            elapsed_ms,
            "Pipeline run completed"
        );

        Ok(PipelineOutcome {
            run_id: ctx.run_id,
            note_count: detected.notes.len(),
            artifacts,
            elapsed_ms,
        })
    }

    async fn stage<T, F>(
        &self,
        ctx: &StageContext<'_>,
        stage: Stage,
        cancel_token: &CancellationToken,
        work: F,
    ) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        if cancel_token.is_cancelled() {
            tracing::warn!(job_id = %ctx.job.id, run_id = %ctx.run_id, stage = %stage, "Run cancelled between stages");
            return Err(PipelineError::Cancelled(stage));
        }

        let started = Instant::now();
        self.events.emit_lossy(JobEvent::StageStarted {
            job_id: ctx.job.id,
            run_id: ctx.run_id,
            stage,
            timestamp: Utc::now(),
        });
        tracing::debug!(job_id = %ctx.job.id, run_id = %ctx.run_id, stage = %stage, "Stage started");

        match work.await {
            Ok(value) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                tracing::info!(job_id = %ctx.job.id, stage = %stage, elapsed_ms, "Stage completed");
                self.events.emit_lossy(JobEvent::StageCompleted {
                    job_id: ctx.job.id,
                    run_id: ctx.run_id,
                    stage,
                    elapsed_ms,
                    timestamp: Utc::now(),
                });
                Ok(value)
            }
            Err(e) => {
                tracing::error!(job_id = %ctx.job.id, stage = %stage, error = %e, "Stage failed");
                self.events.emit_lossy(JobEvent::StageFailed {
                    job_id: ctx.job.id,
                    run_id: ctx.run_id,
                    stage,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                Err(PipelineError::stage(stage, e))
            }
        }
    }
}

/// Compare-and-set a job's status and publish the change
///
/// Returns `false` without emitting when the job was not in `from`.
pub async fn set_status(
    pool: &SqlitePool,
    events: &EventBus,
    job_id: Uuid,
    from: JobStatus,
    to: JobStatus,
) -> saxscore_common::Result<bool> {
    let changed = db::jobs::transition_status(pool, job_id, from, to).await?;
    if changed {
        tracing::debug!(job_id = %job_id, old_status = %from, new_status = %to, "Job status changed");
        events.emit_lossy(JobEvent::StatusChanged {
            job_id,
            old_status: from,
            new_status: to,
            timestamp: Utc::now(),
        });
    }
    Ok(changed)
}
