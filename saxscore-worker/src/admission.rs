//! Job admission and re-admission

use saxscore_common::db;
use saxscore_common::events::EventBus;
use saxscore_common::models::{AudioBlob, BlobKind, Job};
use saxscore_common::{Error, Instrument, JobStatus, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::pipeline::set_status;
use crate::queue::JobQueue;

/// Store a new job with its original audio, then enqueue it
///
/// The job row and the blob commit together; the id is enqueued only
/// after the commit.
pub async fn admit(
    pool: &SqlitePool,
    queue: &JobQueue,
    file_name: &str,
    instrument_hint: Instrument,
    audio: Vec<u8>,
) -> Result<Job> {
    let file_name = file_name.trim();
    if file_name.is_empty() {
        return Err(Error::InvalidInput("file name must not be empty".to_string()));
    }
    if audio.is_empty() {
        return Err(Error::InvalidInput("audio upload is empty".to_string()));
    }

    let job = Job::new(file_name, instrument_hint);
    let original = AudioBlob::new(job.id, BlobKind::Original, None, audio);
    db::jobs::insert_job_with_original(pool, &job, &original).await?;
    queue.enqueue(job.id);

    tracing::info!(
        job_id = %job.id,
        file_name = %job.file_name,
        hint = %job.instrument_hint,
        bytes = original.content.len(),
        "Job admitted"
    );
    Ok(job)
}

/// Queue a finished job for a new pipeline run
///
/// Refused while the job is `queued` or `processing`.
pub async fn readmit(pool: &SqlitePool, queue: &JobQueue, events: &EventBus, job_id: Uuid) -> Result<Job> {
    let job = db::jobs::load_job(pool, job_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;

    if !job.status.is_terminal() {
        return Err(Error::Conflict(format!("job {} is {}", job_id, job.status)));
    }

    if !set_status(pool, events, job_id, job.status, JobStatus::Queued).await? {
        // Someone else re-admitted it between the load and the update
        return Err(Error::Conflict(format!("job {} changed status concurrently", job_id)));
    }
    queue.enqueue(job_id);

    tracing::info!(job_id = %job_id, previous_status = %job.status, "Job re-admitted");

    db::jobs::load_job(pool, job_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
}
