//! File-based exchange documents for the analysis process
//!
//! Response (`--output-json`):
//! ```json
//! { "meta": { "key": "A major", "meter": "4/4", "tempo": 120, "instrument": "alto" },
//!   "notes": [ { "start": 0.0, "end": 0.5, "midi": 69, "velocity": 90, "name": "A4" } ] }
//! ```
//! `meta` and every field inside it are optional; `notes` is required.
//! Unknown fields (such as `name`) are ignored.
//!
//! Render request (`--input-json`) has the same shape, with
//! `meta.instrument` set to the render target.

use serde::{Deserialize, Serialize};

use super::{BackendError, DetectedNote, DetectionMeta, RenderRequest};
use saxscore_common::Instrument;

#[derive(Debug, Deserialize)]
struct NotesDocument {
    #[serde(default)]
    meta: Option<MetaDocument>,
    notes: Vec<NoteDocument>,
}

#[derive(Debug, Default, Deserialize)]
struct MetaDocument {
    key: Option<String>,
    meter: Option<String>,
    tempo: Option<f64>,
    instrument: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NoteDocument {
    start: f64,
    end: f64,
    midi: i64,
    #[serde(default)]
    velocity: Option<i64>,
}

/// Parse and validate a notes document
pub fn parse_notes_document(bytes: &[u8]) -> Result<(DetectionMeta, Vec<DetectedNote>), BackendError> {
    let document: NotesDocument = serde_json::from_slice(bytes)
        .map_err(|e| BackendError::MalformedResponse(format!("notes document: {}", e)))?;

    let meta = parse_meta(document.meta.unwrap_or_default())?;
    let notes = document
        .notes
        .into_iter()
        .enumerate()
        .map(|(index, note)| parse_note(index, note))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((meta, notes))
}

fn parse_meta(meta: MetaDocument) -> Result<DetectionMeta, BackendError> {
    let tempo = match meta.tempo {
        Some(t) if !t.is_finite() || t <= 0.0 => {
            return Err(BackendError::MalformedResponse(format!("meta.tempo out of range: {}", t)))
        }
        other => other,
    };

    let instrument = match meta.instrument.as_deref().map(str::parse::<Instrument>) {
        None => None,
        Some(Ok(Instrument::Auto)) => None,
        Some(Ok(instrument)) => Some(instrument),
        Some(Err(e)) => return Err(BackendError::MalformedResponse(format!("meta.instrument: {}", e))),
    };

    Ok(DetectionMeta {
        key: non_empty(meta.key),
        meter: non_empty(meta.meter),
        tempo,
        instrument,
    })
}

fn parse_note(index: usize, note: NoteDocument) -> Result<DetectedNote, BackendError> {
    if !note.start.is_finite() || !note.end.is_finite() || note.start < 0.0 {
        return Err(BackendError::MalformedResponse(format!(
            "notes[{}]: invalid times {}..{}",
            index, note.start, note.end
        )));
    }
    if note.end < note.start {
        return Err(BackendError::MalformedResponse(format!(
            "notes[{}]: end {} before start {}",
            index, note.end, note.start
        )));
    }
    let midi = u8::try_from(note.midi)
        .ok()
        .filter(|m| *m <= 127)
        .ok_or_else(|| BackendError::MalformedResponse(format!("notes[{}]: midi {} out of range", index, note.midi)))?;
    let velocity = match note.velocity {
        None => None,
        Some(v) if (0..=127).contains(&v) => Some(v as u8),
        Some(v) => {
            return Err(BackendError::MalformedResponse(format!(
                "notes[{}]: velocity {} out of range",
                index, v
            )))
        }
    };

    Ok(DetectedNote {
        start: note.start,
        end: note.end,
        midi,
        velocity,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Serialize)]
struct RequestDocument<'a> {
    meta: RequestMeta<'a>,
    notes: Vec<RequestNote>,
}

#[derive(Debug, Serialize)]
struct RequestMeta<'a> {
    instrument: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tempo: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meter: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RequestNote {
    start: f64,
    end: f64,
    midi: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    velocity: Option<u8>,
}

/// Serialize a render request document
pub fn render_request_document(request: &RenderRequest) -> Result<Vec<u8>, BackendError> {
    let document = RequestDocument {
        meta: RequestMeta {
            instrument: request.instrument.as_str(),
            tempo: request.tempo,
            key: request.key.as_deref(),
            meter: request.meter.as_deref(),
        },
        notes: request
            .notes
            .iter()
            .map(|n| RequestNote {
                start: n.start,
                end: n.end,
                midi: n.midi,
                velocity: n.velocity,
            })
            .collect(),
    };

    serde_json::to_vec(&document)
        .map_err(|e| BackendError::Execution(format!("Failed to serialize render request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_document_parses() {
        let json = br#"{
            "meta": {"tempo": 96.0, "key": "A major", "meter": "4/4", "instrument": "alto"},
            "notes": [
                {"start": 0.0, "end": 0.5, "midi": 69, "name": "A4", "velocity": 90},
                {"start": 0.5, "end": 1.25, "midi": 71}
            ]
        }"#;

        let (meta, notes) = parse_notes_document(json).unwrap();

        assert_eq!(meta.key.as_deref(), Some("A major"));
        assert_eq!(meta.meter.as_deref(), Some("4/4"));
        assert_eq!(meta.tempo, Some(96.0));
        assert_eq!(meta.instrument, Some(Instrument::Alto));
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].velocity, Some(90));
        assert_eq!(notes[1], DetectedNote { start: 0.5, end: 1.25, midi: 71, velocity: None });
    }

    #[test]
    fn test_meta_is_optional() {
        let (meta, notes) = parse_notes_document(br#"{"notes": []}"#).unwrap();
        assert_eq!(meta, DetectionMeta::default());
        assert!(notes.is_empty());
    }

    #[test]
    fn test_auto_instrument_is_unresolved() {
        let (meta, _) = parse_notes_document(br#"{"meta": {"instrument": "auto"}, "notes": []}"#).unwrap();
        assert_eq!(meta.instrument, None);
    }

    #[test]
    fn test_missing_notes_is_malformed() {
        let result = parse_notes_document(br#"{"meta": {"key": "C major"}}"#);
        assert!(matches!(result, Err(BackendError::MalformedResponse(msg)) if msg.contains("notes")));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(matches!(
            parse_notes_document(b"not json"),
            Err(BackendError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_note_field_validation() {
        let cases: [&[u8]; 6] = [
            br#"{"notes": [{"start": 0.0, "end": 1.0}]}"#,
            br#"{"notes": [{"start": 1.0, "end": 0.5, "midi": 60}]}"#,
            br#"{"notes": [{"start": -1.0, "end": 0.5, "midi": 60}]}"#,
            br#"{"notes": [{"start": 0.0, "end": 0.5, "midi": 128}]}"#,
            br#"{"notes": [{"start": 0.0, "end": 0.5, "midi": -3}]}"#,
            br#"{"notes": [{"start": 0.0, "end": 0.5, "midi": 60, "velocity": 300}]}"#,
        ];
        for case in cases {
            assert!(
                matches!(parse_notes_document(case), Err(BackendError::MalformedResponse(_))),
                "accepted {}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_bad_meta_is_malformed() {
        assert!(parse_notes_document(br#"{"meta": {"tempo": 0}, "notes": []}"#).is_err());
        assert!(parse_notes_document(br#"{"meta": {"instrument": "kazoo"}, "notes": []}"#).is_err());
    }

    #[test]
    fn test_render_request_shape() {
        let request = RenderRequest {
            instrument: Instrument::Tenor,
            notes: vec![DetectedNote { start: 0.0, end: 1.0, midi: 69, velocity: None }],
            tempo: Some(120.0),
            key: Some("C major".to_string()),
            meter: None,
        };

        let bytes = render_request_document(&request).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["meta"]["instrument"], "tenor");
        assert_eq!(value["meta"]["tempo"], 120.0);
        assert_eq!(value["meta"]["key"], "C major");
        assert!(value["meta"].get("meter").is_none());
        assert_eq!(value["notes"][0]["midi"], 69);
        assert!(value["notes"][0].get("velocity").is_none());
    }
}
