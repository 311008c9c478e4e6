//! Stage 3: render and persist one artifact per configured format

use chrono::Utc;
use saxscore_common::db;
use saxscore_common::events::JobEvent;
use saxscore_common::models::ExportArtifact;
use saxscore_common::ExportFormat;

use super::detection::DetectionOutput;
use super::{StageContext, StageError};
use crate::backend::RenderRequest;
use crate::formats;

/// Returns the tags written, in configured order
pub(super) async fn run(ctx: &StageContext<'_>, detected: &DetectionOutput) -> Result<Vec<String>, StageError> {
    let mut written = Vec::with_capacity(ctx.config.export_formats.len());

    for format in &ctx.config.export_formats {
        let content = render(ctx, detected, *format).await?;
        let artifact = ExportArtifact::new(ctx.job.id, format.tag(None), Some(ctx.run_id), content);
        db::exports::insert_artifact(ctx.db, &artifact).await?;

        tracing::debug!(
            job_id = %ctx.job.id,
            format = %artifact.format,
            size_bytes = artifact.content.len(),
            "Export artifact stored"
        );
        ctx.events.emit_lossy(JobEvent::ArtifactCreated {
            job_id: ctx.job.id,
            format: artifact.format.clone(),
            size_bytes: artifact.content.len(),
            timestamp: Utc::now(),
        });

        written.push(artifact.format);
    }

    Ok(written)
}

async fn render(ctx: &StageContext<'_>, detected: &DetectionOutput, format: ExportFormat) -> Result<Vec<u8>, StageError> {
    let analysis = &detected.analysis;
    match format {
        ExportFormat::MusicXml if !detected.score.musicxml.is_empty() => Ok(detected.score.musicxml.clone()),
        ExportFormat::MusicXml => {
            let request = RenderRequest {
                instrument: ctx.job.instrument_hint.resolve(analysis.resolved_instrument),
                notes: detected.exchange_notes(),
                tempo: analysis.tempo_bpm,
                key: analysis.key_signature.clone(),
                meter: analysis.meter.clone(),
            };
            let score = ctx.invoke(ctx.backend.render(&request)).await?;
            Ok(score.musicxml)
        }
        ExportFormat::Json => Ok(formats::json::encode(&detected.exchange_notes())?),
        ExportFormat::Midi => Ok(formats::midi::encode(
            &detected.exchange_notes(),
            analysis.tempo_bpm,
            analysis.meter.as_deref(),
        )?),
    }
}
