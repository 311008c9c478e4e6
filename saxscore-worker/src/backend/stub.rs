//! Deterministic in-process backend
//!
//! Separation returns its input, detection returns a configured note list
//! and metadata, rendering writes a plain MusicXML document. Any capability
//! can be told to fail, and every call is counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use saxscore_common::Instrument;

use super::{
    AnalysisBackend, AudioInput, BackendError, DetectedNote, Detection, DetectionMeta, RenderRequest, RenderedScore,
};
use crate::formats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Separate,
    Detect,
    Render,
}

impl Capability {
    fn index(self) -> usize {
        match self {
            Capability::Separate => 0,
            Capability::Detect => 1,
            Capability::Render => 2,
        }
    }
}

/// How a failing capability fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Exit,
    Malformed,
}

#[derive(Debug)]
pub struct StubBackend {
    notes: Vec<DetectedNote>,
    meta: DetectionMeta,
    failures: HashMap<Capability, Failure>,
    delay: Option<Duration>,
    emit_midi: bool,
    detect_score: bool,
    calls: [AtomicUsize; 3],
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StubBackend {
    /// Four quarter notes (A4 B4 C#5 D5) at 120 bpm in A major, 4/4
    pub fn new() -> Self {
        let notes = [69u8, 71, 73, 74]
            .iter()
            .enumerate()
            .map(|(i, midi)| DetectedNote {
                start: i as f64 * 0.5,
                end: (i + 1) as f64 * 0.5,
                midi: *midi,
                velocity: Some(90),
            })
            .collect();

        Self {
            notes,
            meta: DetectionMeta {
                key: Some("A major".to_string()),
                meter: Some("4/4".to_string()),
                tempo: Some(120.0),
                instrument: None,
            },
            failures: HashMap::new(),
            delay: None,
            emit_midi: false,
            detect_score: true,
            calls: Default::default(),
        }
    }

    pub fn with_notes(mut self, notes: Vec<DetectedNote>) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_meta(mut self, meta: DetectionMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Make `capability` fail as a non-zero exit
    pub fn failing(mut self, capability: Capability) -> Self {
        self.failures.insert(capability, Failure::Exit);
        self
    }

    /// Make `capability` return an output that does not parse
    pub fn malformed(mut self, capability: Capability) -> Self {
        self.failures.insert(capability, Failure::Malformed);
        self
    }

    /// Sleep before answering every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Also return a MIDI rendering
    pub fn with_midi(mut self) -> Self {
        self.emit_midi = true;
        self
    }

    /// Detection returns an empty notation document, leaving rendering to `render`
    pub fn without_detection_score(mut self) -> Self {
        self.detect_score = false;
        self
    }

    /// Number of times `capability` was invoked
    pub fn calls(&self, capability: Capability) -> usize {
        self.calls[capability.index()].load(Ordering::SeqCst)
    }

    async fn enter(&self, capability: Capability) -> Result<(), BackendError> {
        self.calls[capability.index()].fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.failures.get(&capability) {
            None => Ok(()),
            Some(Failure::Exit) => Err(BackendError::Failed {
                code: Some(1),
                stderr: format!("stub backend: {:?} failed", capability),
            }),
            Some(Failure::Malformed) => Err(BackendError::MalformedResponse(format!(
                "stub backend: {:?} returned garbage",
                capability
            ))),
        }
    }

    fn score(&self, notes: &[DetectedNote], instrument: Instrument, tempo: Option<f64>, meter: Option<&str>) -> RenderedScore {
        let midi = if self.emit_midi {
            formats::midi::encode(notes, tempo, meter).ok()
        } else {
            None
        };
        RenderedScore {
            musicxml: formats::musicxml::render(notes, instrument, tempo),
            midi,
        }
    }
}

#[async_trait]
impl AnalysisBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn separate(&self, input: AudioInput<'_>, _hint: Instrument) -> Result<Vec<u8>, BackendError> {
        self.enter(Capability::Separate).await?;
        Ok(input.bytes.to_vec())
    }

    async fn detect(&self, _input: AudioInput<'_>, hint: Instrument) -> Result<Detection, BackendError> {
        self.enter(Capability::Detect).await?;

        let mut meta = self.meta.clone();
        if meta.instrument.is_none() && hint == Instrument::Auto {
            meta.instrument = median_pitch(&self.notes).map(Instrument::closest_to);
        }

        let score = if self.detect_score {
            let instrument = hint.resolve(meta.instrument);
            self.score(&self.notes, instrument, meta.tempo, meta.meter.as_deref())
        } else {
            RenderedScore {
                musicxml: Vec::new(),
                midi: None,
            }
        };

        Ok(Detection {
            meta,
            notes: self.notes.clone(),
            score,
        })
    }

    async fn render(&self, request: &RenderRequest) -> Result<RenderedScore, BackendError> {
        self.enter(Capability::Render).await?;
        Ok(self.score(&request.notes, request.instrument, request.tempo, request.meter.as_deref()))
    }
}

fn median_pitch(notes: &[DetectedNote]) -> Option<f64> {
    if notes.is_empty() {
        return None;
    }
    let mut pitches: Vec<u8> = notes.iter().map(|n| n.midi).collect();
    pitches.sort_unstable();
    let mid = pitches.len() / 2;
    let median = if pitches.len() % 2 == 0 {
        (f64::from(pitches[mid - 1]) + f64::from(pitches[mid])) / 2.0
    } else {
        f64::from(pitches[mid])
    };
    Some(median)
}
