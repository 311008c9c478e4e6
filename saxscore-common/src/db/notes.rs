//! Note event operations

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{format_timestamp, parse_uuid};
use crate::models::{JobAnalysis, NoteEvent};
use crate::{Error, Result};

/// Write one run's detected notes and the job's analysis fields in a single transaction
///
/// The job's `notes_run_id` moves to `run_id` in the same commit, so
/// readers see either the previous run's notes or the complete new set.
pub async fn insert_run_notes(
    pool: &SqlitePool,
    job_id: Uuid,
    run_id: Uuid,
    notes: &[NoteEvent],
    analysis: &JobAnalysis,
) -> Result<()> {
    if let Some(stray) = notes.iter().find(|n| n.job_id != job_id || n.run_id != run_id) {
        return Err(Error::Internal(format!(
            "Note {} does not belong to run {}",
            stray.seq, run_id
        )));
    }

    let job_id_str = job_id.to_string();
    let run_id_str = run_id.to_string();
    let mut tx = pool.begin().await?;

    for note in notes {
        sqlx::query(
            r#"
            INSERT INTO note_events (
                job_id, run_id, seq, start_seconds, end_seconds, pitch, velocity, measure
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job_id_str)
        .bind(&run_id_str)
        .bind(note.seq as i64)
        .bind(note.start)
        .bind(note.end)
        .bind(note.pitch as i64)
        .bind(note.velocity.map(|v| v as i64))
        .bind(note.measure.map(|m| m as i64))
        .execute(&mut *tx)
        .await?;
    }

    let updated = sqlx::query(
        r#"
        UPDATE jobs SET
            key_signature = COALESCE(?, key_signature),
            meter = COALESCE(?, meter),
            tempo_bpm = COALESCE(?, tempo_bpm),
            resolved_instrument = COALESCE(?, resolved_instrument),
            notes_run_id = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&analysis.key_signature)
    .bind(&analysis.meter)
    .bind(analysis.tempo_bpm)
    .bind(analysis.resolved_instrument.map(|i| i.as_str()))
    .bind(&run_id_str)
    .bind(format_timestamp(&chrono::Utc::now()))
    .bind(&job_id_str)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() != 1 {
        return Err(Error::NotFound(format!("Job not found: {}", job_id)));
    }

    tx.commit().await?;
    Ok(())
}

/// Notes written by one run, in detection order
pub async fn load_run_notes(pool: &SqlitePool, job_id: Uuid, run_id: Uuid) -> Result<Vec<NoteEvent>> {
    let rows = sqlx::query(
        r#"
        SELECT job_id, run_id, seq, start_seconds, end_seconds, pitch, velocity, measure
        FROM note_events
        WHERE job_id = ? AND run_id = ?
        ORDER BY seq ASC
        "#,
    )
    .bind(job_id.to_string())
    .bind(run_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(note_from_row).collect()
}

/// Notes of the job's most recent successful detection, empty if none
pub async fn load_current_notes(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<NoteEvent>> {
    let run_id: Option<Option<String>> = sqlx::query_scalar("SELECT notes_run_id FROM jobs WHERE id = ?")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    match run_id.flatten() {
        Some(run_id) => load_run_notes(pool, job_id, parse_uuid("notes_run_id", &run_id)?).await,
        None => Ok(Vec::new()),
    }
}

/// Number of notes stored for a job, optionally limited to one run
pub async fn count_notes(pool: &SqlitePool, job_id: Uuid, run_id: Option<Uuid>) -> Result<i64> {
    let count: i64 = match run_id {
        Some(run_id) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM note_events WHERE job_id = ? AND run_id = ?")
                .bind(job_id.to_string())
                .bind(run_id.to_string())
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM note_events WHERE job_id = ?")
                .bind(job_id.to_string())
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

fn note_from_row(row: &SqliteRow) -> Result<NoteEvent> {
    let job_id: String = row.try_get("job_id")?;
    let run_id: String = row.try_get("run_id")?;
    let seq: i64 = row.try_get("seq")?;
    let pitch: i64 = row.try_get("pitch")?;
    let velocity: Option<i64> = row.try_get("velocity")?;
    let measure: Option<i64> = row.try_get("measure")?;

    Ok(NoteEvent {
        job_id: parse_uuid("job_id", &job_id)?,
        run_id: parse_uuid("run_id", &run_id)?,
        seq: seq as u32,
        start: row.try_get("start_seconds")?,
        end: row.try_get("end_seconds")?,
        pitch: pitch.clamp(0, 127) as u8,
        velocity: velocity.map(|v| v.clamp(0, 127) as u8),
        measure: measure.map(|m| m.max(0) as u32),
    })
}
