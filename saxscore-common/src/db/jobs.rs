//! Job record operations

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp, parse_uuid, retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use crate::models::{AudioBlob, BlobKind, Instrument, Job, JobStatus};
use crate::{Error, Result};

const JOB_COLUMNS: &str = r#"
    id, file_name, instrument_hint, status, key_signature, meter,
    tempo_bpm, resolved_instrument, notes_run_id, created_at, updated_at
"#;

/// Insert a new job together with its original upload
///
/// Both rows commit in one transaction, so a job is never visible without
/// its original audio.
pub async fn insert_job_with_original(pool: &SqlitePool, job: &Job, original: &AudioBlob) -> Result<()> {
    if original.kind != BlobKind::Original || original.job_id != job.id {
        return Err(Error::Internal(
            "Admission requires the job's original blob".to_string(),
        ));
    }

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, file_name, instrument_hint, status, key_signature, meter,
            tempo_bpm, resolved_instrument, notes_run_id, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id.to_string())
    .bind(&job.file_name)
    .bind(job.instrument_hint.as_str())
    .bind(job.status.as_str())
    .bind(&job.key_signature)
    .bind(&job.meter)
    .bind(job.tempo_bpm)
    .bind(job.resolved_instrument.map(|i| i.as_str()))
    .bind(job.notes_run_id.map(|id| id.to_string()))
    .bind(format_timestamp(&job.created_at))
    .bind(format_timestamp(&job.updated_at))
    .execute(&mut *tx)
    .await?;

    super::blobs::insert_blob_in(&mut tx, original).await?;

    tx.commit().await?;
    Ok(())
}

/// Load job by id
pub async fn load_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|row| job_from_row(&row)).transpose()
}

/// Ids of jobs in `status`, oldest first
pub async fn job_ids_with_status(pool: &SqlitePool, status: JobStatus) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM jobs WHERE status = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;

    ids.iter().map(|id| parse_uuid("id", id)).collect()
}

/// Move a job from `from` to `to` if it is still in `from`
///
/// Returns `false` when the job is missing or was no longer in `from`; the
/// check and the update are a single statement, so two callers racing on
/// the same job cannot both succeed.
pub async fn transition_status(pool: &SqlitePool, job_id: Uuid, from: JobStatus, to: JobStatus) -> Result<bool> {
    if !from.can_transition_to(to) {
        return Err(Error::Internal(format!(
            "Illegal job status transition {} -> {}",
            from, to
        )));
    }

    let id = job_id.to_string();
    let affected = retry_on_lock("transition_status", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let now = format_timestamp(&chrono::Utc::now());
        let result = sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(&now)
            .bind(&id)
            .bind(from.as_str())
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    })
    .await?;

    Ok(affected == 1)
}

/// Count jobs per status, for diagnostics
pub async fn count_by_status(pool: &SqlitePool) -> Result<Vec<(JobStatus, i64)>> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| -> Result<(JobStatus, i64)> {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            Ok((status.parse()?, count))
        })
        .collect()
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let hint: String = row.try_get("instrument_hint")?;
    let status: String = row.try_get("status")?;
    let resolved: Option<String> = row.try_get("resolved_instrument")?;
    let notes_run_id: Option<String> = row.try_get("notes_run_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Job {
        id: parse_uuid("id", &id)?,
        file_name: row.try_get("file_name")?,
        instrument_hint: hint.parse()?,
        status: status.parse()?,
        key_signature: row.try_get("key_signature")?,
        meter: row.try_get("meter")?,
        tempo_bpm: row.try_get("tempo_bpm")?,
        resolved_instrument: resolved.map(|s| s.parse::<Instrument>()).transpose()?,
        notes_run_id: notes_run_id.map(|s| parse_uuid("notes_run_id", &s)).transpose()?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}
