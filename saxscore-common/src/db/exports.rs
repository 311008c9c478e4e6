//! Export artifact operations
//!
//! Artifacts only accumulate; there is no update or delete.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp, parse_uuid};
use crate::models::ExportArtifact;
use crate::Result;

/// Artifact metadata without its content
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub id: Uuid,
    pub format: String,
    pub run_id: Option<Uuid>,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

pub async fn insert_artifact(pool: &SqlitePool, artifact: &ExportArtifact) -> Result<()> {
    insert_artifacts(pool, std::slice::from_ref(artifact)).await
}

/// Persist several artifacts in one transaction; none are kept if any insert fails
pub async fn insert_artifacts(pool: &SqlitePool, artifacts: &[ExportArtifact]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for artifact in artifacts {
        insert_artifact_in(&mut tx, artifact).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn insert_artifact_in(tx: &mut Transaction<'_, Sqlite>, artifact: &ExportArtifact) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO export_artifacts (id, job_id, format, run_id, content, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(artifact.id.to_string())
    .bind(artifact.job_id.to_string())
    .bind(&artifact.format)
    .bind(artifact.run_id.map(|id| id.to_string()))
    .bind(&artifact.content)
    .bind(format_timestamp(&artifact.created_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Newest artifact with the given format tag
pub async fn latest_artifact(pool: &SqlitePool, job_id: Uuid, format: &str) -> Result<Option<ExportArtifact>> {
    let row = sqlx::query(
        r#"
        SELECT id, job_id, format, run_id, content, created_at
        FROM export_artifacts
        WHERE job_id = ? AND format = ?
        ORDER BY created_at DESC, rowid DESC
        LIMIT 1
        "#,
    )
    .bind(job_id.to_string())
    .bind(format)
    .fetch_optional(pool)
    .await?;

    row.map(|row| artifact_from_row(&row)).transpose()
}

/// All artifacts of a job, oldest first
pub async fn list_artifacts(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<ArtifactSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT id, format, run_id, LENGTH(content) AS size_bytes, created_at
        FROM export_artifacts
        WHERE job_id = ?
        ORDER BY created_at ASC, rowid ASC
        "#,
    )
    .bind(job_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<ArtifactSummary> {
            let id: String = row.try_get("id")?;
            let run_id: Option<String> = row.try_get("run_id")?;
            let created_at: String = row.try_get("created_at")?;
            Ok(ArtifactSummary {
                id: parse_uuid("id", &id)?,
                format: row.try_get("format")?,
                run_id: run_id.map(|s| parse_uuid("run_id", &s)).transpose()?,
                size_bytes: row.try_get("size_bytes")?,
                created_at: parse_timestamp("created_at", &created_at)?,
            })
        })
        .collect()
}

/// Number of artifacts for a job, optionally limited to one pipeline run
pub async fn count_artifacts(pool: &SqlitePool, job_id: Uuid, run_id: Option<Uuid>) -> Result<i64> {
    let count: i64 = match run_id {
        Some(run_id) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM export_artifacts WHERE job_id = ? AND run_id = ?")
                .bind(job_id.to_string())
                .bind(run_id.to_string())
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM export_artifacts WHERE job_id = ?")
                .bind(job_id.to_string())
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

fn artifact_from_row(row: &SqliteRow) -> Result<ExportArtifact> {
    let id: String = row.try_get("id")?;
    let job_id: String = row.try_get("job_id")?;
    let run_id: Option<String> = row.try_get("run_id")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(ExportArtifact {
        id: parse_uuid("id", &id)?,
        job_id: parse_uuid("job_id", &job_id)?,
        format: row.try_get("format")?,
        run_id: run_id.map(|s| parse_uuid("run_id", &s)).transpose()?,
        content: row.try_get("content")?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}
