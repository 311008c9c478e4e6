//! Standard MIDI File export
//!
//! Single track (format 0), 480 ticks per quarter note, channel 0.
//! Velocity defaults to 80 when detection did not report one.

use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};

use super::{effective_tempo, seconds_to_quarters, FormatError};
use crate::backend::DetectedNote;

pub const TICKS_PER_QUARTER: u16 = 480;
const DEFAULT_VELOCITY: u8 = 80;
const MAX_TEMPO_MICROS: u32 = 0x00FF_FFFF;
const MAX_DELTA: u32 = 0x0FFF_FFFF;

/// Encode notes as an SMF document
///
/// `meter` adds a time signature event when it is `n/d` with `d` a power of two.
pub fn encode(notes: &[DetectedNote], tempo_bpm: Option<f64>, meter: Option<&str>) -> Result<Vec<u8>, FormatError> {
    let bpm = effective_tempo(tempo_bpm);
    let micros_per_quarter = ((60_000_000.0 / bpm).round() as u32).clamp(1, MAX_TEMPO_MICROS);

    let mut track = Vec::with_capacity(notes.len() * 2 + 3);
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(micros_per_quarter))),
    });
    if let Some((numerator, denominator_pow)) = meter.and_then(time_signature) {
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::TimeSignature(numerator, denominator_pow, 24, 8)),
        });
    }

    // (tick, is_note_on, key, velocity); note-offs sort before note-ons on the same tick
    let mut events: Vec<(u32, bool, u8, u8)> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        let on = to_ticks(note.start, bpm);
        let off = to_ticks(note.end, bpm).max(on + 1);
        let key = note.midi.min(127);
        let velocity = note.velocity.unwrap_or(DEFAULT_VELOCITY).clamp(1, 127);
        events.push((on, true, key, velocity));
        events.push((off, false, key, 0));
    }
    events.sort_by_key(|(tick, is_on, _, _)| (*tick, *is_on));

    let mut last_tick = 0u32;
    for (tick, is_on, key, velocity) in events {
        let delta = (tick - last_tick).min(MAX_DELTA);
        last_tick = tick;
        let message = if is_on {
            MidiMessage::NoteOn { key: u7::new(key), vel: u7::new(velocity) }
        } else {
            MidiMessage::NoteOff { key: u7::new(key), vel: u7::new(0) }
        };
        track.push(TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi { channel: u4::new(0), message },
        });
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let smf = Smf {
        header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(TICKS_PER_QUARTER))),
        tracks: vec![track],
    };

    let mut bytes = Vec::new();
    smf.write_std(&mut bytes)?;
    Ok(bytes)
}

fn to_ticks(seconds: f64, bpm: f64) -> u32 {
    let ticks = seconds_to_quarters(seconds.max(0.0), bpm) * f64::from(TICKS_PER_QUARTER);
    ticks.round().min(f64::from(MAX_DELTA)) as u32
}

/// `"6/8"` → `(6, 3)`; the denominator is stored as a power of two
fn time_signature(meter: &str) -> Option<(u8, u8)> {
    let (num, den) = meter.split_once('/')?;
    let numerator: u8 = num.trim().parse().ok()?;
    let denominator: u8 = den.trim().parse().ok()?;
    if numerator == 0 || !denominator.is_power_of_two() {
        return None;
    }
    Some((numerator, denominator.trailing_zeros() as u8))
}
