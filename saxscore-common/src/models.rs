//! Record types shared between the worker, the store and the HTTP layer
//!
//! A [`Job`] owns its audio blobs, note events and export artifacts. The
//! worker is the only writer of job status after admission.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Error, Result};

/// Job lifecycle status
///
/// `queued → processing → done | error`. `done` and `error` end a run;
/// re-admission moves a finished job back to `queued` for a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted, waiting in the queue
    Queued,
    /// Picked up by the worker, stages running
    Processing,
    /// All stages succeeded and at least one artifact exists
    Done,
    /// A stage failed or the run was abandoned
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    /// True once a run has finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Whether `self → next` is a legal edge of the status machine
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Done)
                | (Processing, Error)
                | (Done, Queued)
                | (Error, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(Error::InvalidInput(format!("Unknown job status: {}", other))),
        }
    }
}

/// Target instrument (saxophone family) or `auto` for backend detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instrument {
    Soprano,
    Alto,
    Tenor,
    Baritone,
    Auto,
}

impl Instrument {
    pub const CONCRETE: [Instrument; 4] = [
        Instrument::Soprano,
        Instrument::Alto,
        Instrument::Tenor,
        Instrument::Baritone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Instrument::Soprano => "soprano",
            Instrument::Alto => "alto",
            Instrument::Tenor => "tenor",
            Instrument::Baritone => "baritone",
            Instrument::Auto => "auto",
        }
    }

    /// Replace `auto` with `fallback`, or soprano when no fallback is known
    pub fn resolve(self, fallback: Option<Instrument>) -> Instrument {
        match self {
            Instrument::Auto => match fallback {
                Some(Instrument::Auto) | None => Instrument::Soprano,
                Some(concrete) => concrete,
            },
            concrete => concrete,
        }
    }

    /// Semitones between concert pitch and written pitch
    pub fn written_offset(&self) -> i32 {
        match self {
            Instrument::Soprano | Instrument::Auto => 2,
            Instrument::Alto => 9,
            Instrument::Tenor => 14,
            Instrument::Baritone => 21,
        }
    }

    /// Typical concert-pitch center of the instrument's range (MIDI number)
    fn range_center(&self) -> f64 {
        match self {
            Instrument::Soprano | Instrument::Auto => 76.0,
            Instrument::Alto => 69.0,
            Instrument::Tenor => 62.0,
            Instrument::Baritone => 55.0,
        }
    }

    /// Instrument whose range center is closest to `median_pitch`
    pub fn closest_to(median_pitch: f64) -> Instrument {
        Instrument::CONCRETE
            .iter()
            .copied()
            .min_by(|a, b| {
                let da = (a.range_center() - median_pitch).abs();
                let db = (b.range_center() - median_pitch).abs();
                da.total_cmp(&db)
            })
            .unwrap_or(Instrument::Soprano)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Instrument {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "soprano" => Ok(Instrument::Soprano),
            "alto" => Ok(Instrument::Alto),
            "tenor" => Ok(Instrument::Tenor),
            "baritone" => Ok(Instrument::Baritone),
            "auto" => Ok(Instrument::Auto),
            other => Err(Error::InvalidInput(format!("Unknown instrument: {}", other))),
        }
    }
}

/// Export format understood by the export stage and the download endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    MusicXml,
    Json,
    Midi,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::MusicXml => "musicxml",
            ExportFormat::Json => "json",
            ExportFormat::Midi => "midi",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::MusicXml => "application/vnd.recordare.musicxml+xml",
            ExportFormat::Json => "application/json",
            ExportFormat::Midi => "audio/midi",
        }
    }

    /// Artifact tag, qualified with the target instrument for transposed renders
    ///
    /// `musicxml`, `json`, `musicxml-alto`, ...
    pub fn tag(&self, target: Option<Instrument>) -> String {
        match target {
            Some(instrument) => format!("{}-{}", self.as_str(), instrument),
            None => self.as_str().to_string(),
        }
    }

    /// Split an artifact tag into its format and optional target instrument
    pub fn parse_tag(tag: &str) -> Result<(ExportFormat, Option<Instrument>)> {
        match tag.split_once('-') {
            Some((format, target)) => Ok((format.parse()?, Some(target.parse()?))),
            None => Ok((tag.parse()?, None)),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "musicxml" => Ok(ExportFormat::MusicXml),
            "json" => Ok(ExportFormat::Json),
            "midi" => Ok(ExportFormat::Midi),
            other => Err(Error::InvalidInput(format!("Unknown export format: {}", other))),
        }
    }
}

/// One transcription request and its lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Name of the uploaded file (used for its extension when handing audio to the backend)
    pub file_name: String,
    pub instrument_hint: Instrument,
    pub status: JobStatus,
    pub key_signature: Option<String>,
    pub meter: Option<String>,
    pub tempo_bpm: Option<f64>,
    /// Concrete instrument chosen by detection when the hint was `auto`
    pub resolved_instrument: Option<Instrument>,
    /// Pipeline run whose note events are current
    pub notes_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(file_name: impl Into<String>, instrument_hint: Instrument) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            instrument_hint,
            status: JobStatus::Queued,
            key_signature: None,
            meter: None,
            tempo_bpm: None,
            resolved_instrument: None,
            notes_run_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Instrument to engrave for: resolved instrument, then the hint, then soprano
    pub fn effective_instrument(&self) -> Instrument {
        self.instrument_hint.resolve(self.resolved_instrument)
    }
}

/// Detection results written onto the job record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobAnalysis {
    pub key_signature: Option<String>,
    pub meter: Option<String>,
    pub tempo_bpm: Option<f64>,
    pub resolved_instrument: Option<Instrument>,
}

/// Which audio a blob holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
    /// Uploaded recording, written once at admission
    Original,
    /// Target instrument isolated by the separation stage
    Isolated,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::Original => "original",
            BlobKind::Isolated => "isolated",
        }
    }
}

impl FromStr for BlobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "original" => Ok(BlobKind::Original),
            "isolated" => Ok(BlobKind::Isolated),
            other => Err(Error::InvalidInput(format!("Unknown blob kind: {}", other))),
        }
    }
}

/// Raw audio bytes belonging to a job
#[derive(Debug, Clone)]
pub struct AudioBlob {
    pub id: Uuid,
    pub job_id: Uuid,
    pub kind: BlobKind,
    /// Pipeline run that produced the blob (`None` for the original upload)
    pub run_id: Option<Uuid>,
    pub content: Vec<u8>,
    /// Lowercase hex SHA-256 of `content`
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

impl AudioBlob {
    pub fn new(job_id: Uuid, kind: BlobKind, run_id: Option<Uuid>, content: Vec<u8>) -> Self {
        let sha256 = format!("{:x}", Sha256::digest(&content));
        Self {
            id: Uuid::new_v4(),
            job_id,
            kind,
            run_id,
            content,
            sha256,
            created_at: Utc::now(),
        }
    }
}

/// A detected note, immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub job_id: Uuid,
    pub run_id: Uuid,
    /// Position within the run's note list
    pub seq: u32,
    /// Onset in seconds
    pub start: f64,
    /// Offset in seconds, never before `start`
    pub end: f64,
    /// MIDI note number
    pub pitch: u8,
    pub velocity: Option<u8>,
    pub measure: Option<u32>,
}

/// Zero-based measure containing `start`, when tempo and meter are known
///
/// The meter is `numerator/denominator`; its length in quarter notes is
/// `numerator * 4 / denominator`.
pub fn measure_index(start: f64, tempo_bpm: Option<f64>, meter: Option<&str>) -> Option<u32> {
    let bpm = tempo_bpm.filter(|t| t.is_finite() && *t > 0.0)?;
    let (num, den) = meter?.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if num <= 0.0 || den <= 0.0 || !start.is_finite() || start < 0.0 {
        return None;
    }
    let quarters_per_measure = num * 4.0 / den;
    let quarters = start * bpm / 60.0;
    Some((quarters / quarters_per_measure).floor() as u32)
}

/// A rendered output document for a job
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Format tag, e.g. `musicxml`, `json`, `musicxml-alto`
    pub format: String,
    /// Pipeline run that produced the artifact (`None` for transposes)
    pub run_id: Option<Uuid>,
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl ExportArtifact {
    pub fn new(job_id: Uuid, format: impl Into<String>, run_id: Option<Uuid>, content: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            format: format.into(),
            run_id,
            content,
            created_at: Utc::now(),
        }
    }
}
