//! In-process export encoders
//!
//! `json` and `midi` exports are encoded here from the run's notes;
//! `musicxml` comes from the analysis backend. [`musicxml`] is the plain
//! writer the stub backend renders with.

pub mod json;
pub mod midi;
pub mod musicxml;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MIDI encoding failed: {0}")]
    Midi(#[from] std::io::Error),
}

/// Tempo assumed when detection did not report one
pub const DEFAULT_TEMPO_BPM: f64 = 120.0;

/// Usable tempo: the detected one when it is finite and positive
pub fn effective_tempo(tempo_bpm: Option<f64>) -> f64 {
    tempo_bpm
        .filter(|t| t.is_finite() && *t > 0.0)
        .unwrap_or(DEFAULT_TEMPO_BPM)
}

/// Seconds to quarter notes at `bpm`
pub fn seconds_to_quarters(seconds: f64, bpm: f64) -> f64 {
    seconds * bpm / 60.0
}
