//! Audio blob operations

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp, parse_uuid};
use crate::models::{AudioBlob, BlobKind};
use crate::Result;

const BLOB_COLUMNS: &str = "id, job_id, kind, run_id, content, sha256, created_at";

/// Persist a blob
pub async fn insert_blob(pool: &SqlitePool, blob: &AudioBlob) -> Result<()> {
    let mut tx = pool.begin().await?;
    insert_blob_in(&mut tx, blob).await?;
    tx.commit().await?;
    Ok(())
}

pub(crate) async fn insert_blob_in(tx: &mut Transaction<'_, Sqlite>, blob: &AudioBlob) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audio_blobs (id, job_id, kind, run_id, content, sha256, size_bytes, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(blob.id.to_string())
    .bind(blob.job_id.to_string())
    .bind(blob.kind.as_str())
    .bind(blob.run_id.map(|id| id.to_string()))
    .bind(&blob.content)
    .bind(&blob.sha256)
    .bind(blob.content.len() as i64)
    .bind(format_timestamp(&blob.created_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// The job's uploaded recording
pub async fn load_original(pool: &SqlitePool, job_id: Uuid) -> Result<Option<AudioBlob>> {
    latest_blob(pool, job_id, BlobKind::Original).await
}

/// Isolated audio written by one pipeline run
pub async fn load_isolated(pool: &SqlitePool, job_id: Uuid, run_id: Uuid) -> Result<Option<AudioBlob>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM audio_blobs WHERE job_id = ? AND kind = 'isolated' AND run_id = ?",
        BLOB_COLUMNS
    ))
    .bind(job_id.to_string())
    .bind(run_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|row| blob_from_row(&row)).transpose()
}

/// Most recent blob of `kind` for a job
pub async fn latest_blob(pool: &SqlitePool, job_id: Uuid, kind: BlobKind) -> Result<Option<AudioBlob>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM audio_blobs WHERE job_id = ? AND kind = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        BLOB_COLUMNS
    ))
    .bind(job_id.to_string())
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(|row| blob_from_row(&row)).transpose()
}

pub async fn count_blobs(pool: &SqlitePool, job_id: Uuid, kind: BlobKind) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audio_blobs WHERE job_id = ? AND kind = ?")
        .bind(job_id.to_string())
        .bind(kind.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn blob_from_row(row: &SqliteRow) -> Result<AudioBlob> {
    let id: String = row.try_get("id")?;
    let job_id: String = row.try_get("job_id")?;
    let kind: String = row.try_get("kind")?;
    let run_id: Option<String> = row.try_get("run_id")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(AudioBlob {
        id: parse_uuid("id", &id)?,
        job_id: parse_uuid("job_id", &job_id)?,
        kind: kind.parse()?,
        run_id: run_id.map(|s| parse_uuid("run_id", &s)).transpose()?,
        content: row.try_get("content")?,
        sha256: row.try_get("sha256")?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}
