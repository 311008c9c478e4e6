//! Analysis backend capability
//!
//! The signal processing (source separation, pitch and onset detection,
//! notation rendering) happens outside this crate. [`AnalysisBackend`] is
//! the seam: [`ProcessBackend`] drives the external analysis process,
//! [`StubBackend`] answers in-process with deterministic data.

pub mod process;
pub mod protocol;
pub mod stub;

pub use process::ProcessBackend;
pub use stub::{Capability, StubBackend};

use async_trait::async_trait;
use saxscore_common::models::NoteEvent;
use saxscore_common::Instrument;
use std::time::Duration;
use thiserror::Error;

/// Backend invocation failures
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend executable could not be found
    #[error("Analysis backend binary not found: {0}")]
    BinaryNotFound(String),

    /// Backend could not be started or awaited
    #[error("Failed to execute analysis backend: {0}")]
    Execution(String),

    /// Backend ran and reported failure; `stderr` carries its diagnostics
    #[error("Analysis backend failed (exit code {code:?}): {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    /// Backend output is missing or does not match the exchange schema
    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    /// Stage limit expired before the backend answered
    #[error("Analysis backend timed out after {0:?}")]
    Timeout(Duration),

    /// Exchange file I/O
    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio handed to the backend
#[derive(Debug, Clone, Copy)]
pub struct AudioInput<'a> {
    pub bytes: &'a [u8],
    /// Original upload name; its extension tells the backend the container format
    pub file_name: &'a str,
}

/// A note as exchanged with the backend
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedNote {
    pub start: f64,
    pub end: f64,
    pub midi: u8,
    pub velocity: Option<u8>,
}

impl From<&NoteEvent> for DetectedNote {
    fn from(note: &NoteEvent) -> Self {
        Self {
            start: note.start,
            end: note.end,
            midi: note.pitch,
            velocity: note.velocity,
        }
    }
}

/// Detection metadata; every field is optional in the exchange
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionMeta {
    pub key: Option<String>,
    pub meter: Option<String>,
    pub tempo: Option<f64>,
    /// Concrete instrument the backend settled on
    pub instrument: Option<Instrument>,
}

/// Rendered notation
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedScore {
    pub musicxml: Vec<u8>,
    pub midi: Option<Vec<u8>>,
}

/// Result of a detection pass
#[derive(Debug, Clone)]
pub struct Detection {
    pub meta: DetectionMeta,
    pub notes: Vec<DetectedNote>,
    pub score: RenderedScore,
}

/// Notes to re-render for a target instrument
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub instrument: Instrument,
    pub notes: Vec<DetectedNote>,
    pub tempo: Option<f64>,
    pub key: Option<String>,
    pub meter: Option<String>,
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Isolate the target instrument from a mix
    async fn separate(&self, input: AudioInput<'_>, hint: Instrument) -> Result<Vec<u8>, BackendError>;

    /// Detect notes, key, meter and tempo and render a first notation document
    async fn detect(&self, input: AudioInput<'_>, hint: Instrument) -> Result<Detection, BackendError>;

    /// Render existing notes for an instrument
    async fn render(&self, request: &RenderRequest) -> Result<RenderedScore, BackendError>;
}
