//! JSON note list export: `[{"start": .., "end": .., "midi": ..}]`

use serde::Serialize;

use super::FormatError;
use crate::backend::DetectedNote;

#[derive(Serialize)]
struct JsonNote {
    start: f64,
    end: f64,
    midi: u8,
}

pub fn encode(notes: &[DetectedNote]) -> Result<Vec<u8>, FormatError> {
    let list: Vec<JsonNote> = notes
        .iter()
        .map(|n| JsonNote {
            start: n.start,
            end: n.end,
            midi: n.midi,
        })
        .collect();
    Ok(serde_json::to_vec(&list)?)
}
