//! Minimal MusicXML writer
//!
//! One part, every note written at the instrument's transposed pitch, no
//! layout, no ties across barlines. Good enough for the stub backend and
//! for checking which instrument a document was rendered for.

use std::fmt::Write as _;

use saxscore_common::Instrument;

use super::{effective_tempo, seconds_to_quarters};
use crate::backend::DetectedNote;

const DIVISIONS: u32 = 4;
const STEPS: [(&str, i8); 12] = [
    ("C", 0),
    ("C", 1),
    ("D", 0),
    ("D", 1),
    ("E", 0),
    ("F", 0),
    ("F", 1),
    ("G", 0),
    ("G", 1),
    ("A", 0),
    ("A", 1),
    ("B", 0),
];

pub fn part_name(instrument: Instrument) -> &'static str {
    match instrument {
        Instrument::Soprano | Instrument::Auto => "Soprano Saxophone",
        Instrument::Alto => "Alto Saxophone",
        Instrument::Tenor => "Tenor Saxophone",
        Instrument::Baritone => "Baritone Saxophone",
    }
}

/// Render concert-pitch notes as a score written for `instrument`
pub fn render(notes: &[DetectedNote], instrument: Instrument, tempo_bpm: Option<f64>) -> Vec<u8> {
    let bpm = effective_tempo(tempo_bpm);
    let offset = instrument.written_offset();

    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<score-partwise version=\"3.1\">\n");
    let _ = writeln!(
        xml,
        "  <part-list><score-part id=\"P1\"><part-name>{}</part-name></score-part></part-list>",
        part_name(instrument)
    );
    xml.push_str("  <part id=\"P1\">\n    <measure number=\"1\">\n");
    let _ = writeln!(
        xml,
        "      <attributes><divisions>{}</divisions><transpose><chromatic>{}</chromatic></transpose></attributes>",
        DIVISIONS, -offset
    );
    let _ = writeln!(
        xml,
        "      <direction><sound tempo=\"{}\"/></direction>",
        bpm.round()
    );

    for note in notes {
        let written = (i32::from(note.midi) + offset).clamp(0, 127);
        let (step, alter) = STEPS[(written % 12) as usize];
        let octave = written / 12 - 1;
        let quarters = seconds_to_quarters(note.end - note.start, bpm);
        let duration = ((quarters * f64::from(DIVISIONS)).round() as u32).max(1);

        xml.push_str("      <note><pitch>");
        let _ = write!(xml, "<step>{}</step>", step);
        if alter != 0 {
            let _ = write!(xml, "<alter>{}</alter>", alter);
        }
        let _ = writeln!(xml, "<octave>{}</octave></pitch><duration>{}</duration></note>", octave, duration);
    }

    xml.push_str("    </measure>\n  </part>\n</score-partwise>\n");
    xml.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a4() -> Vec<DetectedNote> {
        vec![DetectedNote { start: 0.0, end: 0.5, midi: 69, velocity: None }]
    }

    #[test]
    fn test_alto_writes_major_sixth_up() {
        let xml = String::from_utf8(render(&a4(), Instrument::Alto, Some(120.0))).unwrap();

        assert!(xml.contains("<part-name>Alto Saxophone</part-name>"));
        // Concert A4 is written F#5 for alto
        assert!(xml.contains("<step>F</step><alter>1</alter><octave>5</octave>"));
        assert!(xml.contains("<chromatic>-9</chromatic>"));
        // Half a second at 120 bpm is one quarter
        assert!(xml.contains("<duration>4</duration>"));
    }

    #[test]
    fn test_tenor_writes_ninth_up() {
        let xml = String::from_utf8(render(&a4(), Instrument::Tenor, None)).unwrap();
        // Concert A4 is written B5 for tenor
        assert!(xml.contains("<step>B</step><octave>5</octave>"));
    }

    #[test]
    fn test_empty_notes_still_a_document() {
        let xml = String::from_utf8(render(&[], Instrument::Baritone, None)).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.trim_end().ends_with("</score-partwise>"));
    }
}
