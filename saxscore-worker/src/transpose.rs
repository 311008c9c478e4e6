//! Re-render a finished job's notes for another instrument
//!
//! Runs outside the pipeline: no separation, no detection, no status change.
//! Notes and earlier artifacts are never touched; a new artifact tagged
//! `musicxml-<target>` is added (and `midi-<target>` when the backend
//! returns MIDI). If the backend fails nothing is written.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use saxscore_common::db;
use saxscore_common::events::{EventBus, JobEvent};
use saxscore_common::models::ExportArtifact;
use saxscore_common::{ExportFormat, Instrument};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{AnalysisBackend, BackendError, DetectedNote, RenderRequest};
use crate::pipeline::with_timeout;

#[derive(Debug, Error)]
pub enum TransposeError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Job has no detected notes yet
    #[error("Job {0} has no detected notes to transpose")]
    NoNotes(Uuid),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] saxscore_common::Error),
}

/// Artifact written by a transpose
#[derive(Debug, Clone)]
pub struct TransposeResult {
    pub artifact_id: Uuid,
    pub format: String,
    pub target: Instrument,
    /// Tag of the MIDI artifact, when one was written
    pub midi_format: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct Transposer {
    db: SqlitePool,
    backend: Arc<dyn AnalysisBackend>,
    events: EventBus,
    timeout: Option<Duration>,
}

impl Transposer {
    pub fn new(db: SqlitePool, backend: Arc<dyn AnalysisBackend>, events: EventBus) -> Self {
        Self {
            db,
            backend,
            events,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Render the job's current notes for `target`
    ///
    /// `auto` resolves to the instrument detection settled on, else soprano.
    pub async fn transpose(&self, job_id: Uuid, target: Instrument) -> Result<TransposeResult, TransposeError> {
        let job = db::jobs::load_job(&self.db, job_id)
            .await?
            .ok_or(TransposeError::JobNotFound(job_id))?;

        let notes = db::notes::load_current_notes(&self.db, job_id).await?;
        if notes.is_empty() {
            return Err(TransposeError::NoNotes(job_id));
        }

        let target = target.resolve(job.resolved_instrument);
        let request = RenderRequest {
            instrument: target,
            notes: notes.iter().map(DetectedNote::from).collect(),
            tempo: job.tempo_bpm,
            key: job.key_signature.clone(),
            meter: job.meter.clone(),
        };

        tracing::info!(job_id = %job_id, target = %target, notes = notes.len(), "Transposing");
        let score = with_timeout(self.timeout, self.backend.render(&request))
            .await
            .map_err(|e| {
                tracing::warn!(job_id = %job_id, target = %target, error = %e, "Transpose render failed");
                e
            })?;

        if score.musicxml.is_empty() {
            return Err(BackendError::MalformedResponse("render returned an empty score".to_string()).into());
        }

        let artifact = ExportArtifact::new(job_id, ExportFormat::MusicXml.tag(Some(target)), None, score.musicxml);
        let midi_artifact = score
            .midi
            .filter(|m| !m.is_empty())
            .map(|midi| ExportArtifact::new(job_id, ExportFormat::Midi.tag(Some(target)), None, midi));

        // Score and MIDI land together or not at all
        let mut batch = vec![artifact];
        batch.extend(midi_artifact);
        db::exports::insert_artifacts(&self.db, &batch).await?;
        for stored in &batch {
            self.announce(stored);
        }

        let midi_format = batch.get(1).map(|midi| midi.format.clone());
        let artifact = batch.swap_remove(0);

        Ok(TransposeResult {
            artifact_id: artifact.id,
            format: artifact.format,
            target,
            midi_format,
            created_at: artifact.created_at,
        })
    }

    fn announce(&self, artifact: &ExportArtifact) {
        tracing::debug!(job_id = %artifact.job_id, format = %artifact.format, "Transpose artifact stored");
        self.events.emit_lossy(JobEvent::ArtifactCreated {
            job_id: artifact.job_id,
            format: artifact.format.clone(),
            size_bytes: artifact.content.len(),
            timestamp: Utc::now(),
        });
    }
}
