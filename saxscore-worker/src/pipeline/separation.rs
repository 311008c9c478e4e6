//! Stage 1: isolate the target instrument from the original upload

use saxscore_common::db;
use saxscore_common::models::{AudioBlob, BlobKind};

use super::{StageContext, StageError};
use crate::backend::{AudioInput, BackendError};

/// Persist one isolated blob for the run
pub(super) async fn run(ctx: &StageContext<'_>) -> Result<AudioBlob, StageError> {
    let original = db::blobs::load_original(ctx.db, ctx.job.id)
        .await?
        .ok_or_else(|| StageError::MissingInput(format!("original audio for job {}", ctx.job.id)))?;

    let input = AudioInput {
        bytes: &original.content,
        file_name: &ctx.job.file_name,
    };
    let isolated = ctx
        .invoke(ctx.backend.separate(input, ctx.job.instrument_hint))
        .await?;

    if isolated.is_empty() {
        return Err(BackendError::MalformedResponse("separation returned no audio".to_string()).into());
    }

    let blob = AudioBlob::new(ctx.job.id, BlobKind::Isolated, Some(ctx.run_id), isolated);
    db::blobs::insert_blob(ctx.db, &blob).await?;

    tracing::debug!(
        job_id = %ctx.job.id,
        original_bytes = original.content.len(),
        isolated_bytes = blob.content.len(),
        sha256 = %blob.sha256,
        "Isolated audio stored"
    );

    Ok(blob)
}
