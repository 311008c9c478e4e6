//! Stage 2: detect notes and musical metadata from the isolated audio

use saxscore_common::db;
use saxscore_common::models::{measure_index, AudioBlob, JobAnalysis, NoteEvent};

use super::{StageContext, StageError};
use crate::backend::{AudioInput, DetectedNote, RenderedScore};

/// Committed detection results, carried into the export stage
#[derive(Debug, Clone)]
pub(super) struct DetectionOutput {
    pub notes: Vec<NoteEvent>,
    pub analysis: JobAnalysis,
    /// Notation document rendered alongside detection
    pub score: RenderedScore,
}

impl DetectionOutput {
    pub fn exchange_notes(&self) -> Vec<DetectedNote> {
        self.notes.iter().map(DetectedNote::from).collect()
    }
}

/// Notes, key, meter, tempo and resolved instrument commit in one transaction
pub(super) async fn run(ctx: &StageContext<'_>, isolated: &AudioBlob) -> Result<DetectionOutput, StageError> {
    let input = AudioInput {
        bytes: &isolated.content,
        file_name: &ctx.job.file_name,
    };
    let detection = ctx
        .invoke(ctx.backend.detect(input, ctx.job.instrument_hint))
        .await?;

    let analysis = JobAnalysis {
        key_signature: detection.meta.key.clone(),
        meter: detection.meta.meter.clone(),
        tempo_bpm: detection.meta.tempo,
        resolved_instrument: detection.meta.instrument,
    };

    let notes: Vec<NoteEvent> = detection
        .notes
        .iter()
        .enumerate()
        .map(|(seq, note)| NoteEvent {
            job_id: ctx.job.id,
            run_id: ctx.run_id,
            seq: seq as u32,
            start: note.start,
            end: note.end,
            pitch: note.midi,
            velocity: note.velocity,
            measure: measure_index(note.start, analysis.tempo_bpm, analysis.meter.as_deref()),
        })
        .collect();

    db::notes::insert_run_notes(ctx.db, ctx.job.id, ctx.run_id, &notes, &analysis).await?;

    tracing::info!(
        job_id = %ctx.job.id,
        run_id = %ctx.run_id,
        notes = notes.len(),
        key = ?analysis.key_signature,
        meter = ?analysis.meter,
        resolved_instrument = ?analysis.resolved_instrument,
        "Detection results stored"
    );

    Ok(DetectionOutput {
        notes,
        analysis,
        score: detection.score,
    })
}
