//! midi.rs
//!
//! Reads a Standard MIDI File (SMF) into the two shapes the rest of the crate needs:
//! a list of finished notes with start/end times in seconds (for feature extraction)
//! and a flat timeline of timestamped messages (for rendering through a synth).
//!
//! ### Quick primer on MIDI timing
//! - Events inside a track are separated by "delta ticks", not by seconds.
//! - With metrical timing, the header gives pulses-per-quarter-note (PPQ) and Set Tempo
//!   meta events say how many microseconds one quarter note lasts from that tick on.
//!   Before the first Set Tempo the tempo is 500,000 µs per quarter note (120 BPM).
//! - A tempo change in any track affects every track, so the tempo events are gathered
//!   into one `TempoMap` first and every tick is converted through it.
//! - With SMPTE timecode timing a tick has a fixed length and tempo events do not move time.
//!
//! Notes are not stored as such in a MIDI file. A note is a NoteOn followed later by a
//! NoteOff (or a NoteOn with velocity 0) for the same key on the same channel.

use std::collections::HashMap;

use anyhow::{Context, Result};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

/// Default tempo: 500,000 µs per quarter note = 120 BPM
pub const DEFAULT_US_PER_QN: f64 = 500_000.0;

/// A normalized MIDI message used by the renderer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Msg {
    /// Start playing a note: (channel, key, velocity)
    NoteOn(u8, u8, u8),
    /// Stop playing a note: (channel, key)
    NoteOff(u8, u8),
    /// Change instrument program on a channel
    Program(u8, u8),
    /// Generic MIDI controller change: (channel, controller number, value)
    Control(u8, u8, u8),
    /// Pitch bend wheel: (channel, bend value 0–16383, center=8192)
    PitchBend(u8, u16),
    /// Per-note aftertouch pressure
    AfterTouch(u8, u8, u8),
    /// Channel-wide aftertouch pressure
    ChannelAftertouch(u8, u8),
}

/// A MIDI message tied to an absolute time in microseconds.
#[derive(Clone, Copy, Debug)]
pub struct Timed {
    pub t_us: u64,
    pub msg: Msg,
}

/// Every message of every track, ordered by time.
pub struct Timeline {
    pub events: Vec<Timed>,
    /// Time of the last event (in µs)
    pub last_t_us: u64,
}

/// A finished note, times in seconds from the start of the file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Note {
    pub pitch: u8,
    pub start: f64,
    pub end: f64,
}

impl Note {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Parse raw bytes as an SMF.
pub fn parse(bytes: &[u8]) -> Result<Smf<'_>> {
    Smf::parse(bytes).context("parsing standard MIDI file")
}

#[derive(Clone, Copy, Debug)]
enum Clock {
    /// Pulses per quarter note
    Metrical(f64),
    /// Fixed seconds per tick
    Timecode(f64),
}

#[derive(Clone, Copy, Debug)]
struct TempoSegment {
    tick: u64,
    us_per_qn: f64,
    start_us: f64,
}

/// Converts absolute ticks to microseconds, honouring every tempo change in the file.
#[derive(Debug)]
pub struct TempoMap {
    clock: Clock,
    // Never empty; the first segment always starts at tick 0
    segments: Vec<TempoSegment>,
}

impl TempoMap {
    pub fn from_smf(smf: &Smf<'_>) -> Self {
        let clock = match smf.header.timing {
            Timing::Metrical(t) => Clock::Metrical(t.as_int().max(1) as f64),
            Timing::Timecode(fps, sub) => {
                Clock::Timecode(1.0 / (fps.as_f32() as f64 * sub.max(1) as f64))
            }
        };

        let mut changes = tempo_events(smf);
        changes.sort_by_key(|&(tick, _)| tick);

        let mut segments = vec![TempoSegment { tick: 0, us_per_qn: DEFAULT_US_PER_QN, start_us: 0.0 }];
        let ppq = match clock {
            Clock::Metrical(ppq) => ppq,
            Clock::Timecode(_) => return Self { clock, segments },
        };

        for (tick, us_per_qn) in changes {
            let last = segments[segments.len() - 1];
            if tick == last.tick {
                // Later event at the same tick wins
                if let Some(seg) = segments.last_mut() {
                    seg.us_per_qn = us_per_qn;
                }
                continue;
            }
            let start_us = last.start_us + (tick - last.tick) as f64 / ppq * last.us_per_qn;
            segments.push(TempoSegment { tick, us_per_qn, start_us });
        }

        Self { clock, segments }
    }

    pub fn tick_to_us(&self, tick: u64) -> f64 {
        match self.clock {
            Clock::Timecode(sec_per_tick) => tick as f64 * sec_per_tick * 1_000_000.0,
            Clock::Metrical(ppq) => {
                let idx = self.segments.partition_point(|s| s.tick <= tick);
                let seg = &self.segments[idx.saturating_sub(1)];
                seg.start_us + (tick - seg.tick) as f64 / ppq * seg.us_per_qn
            }
        }
    }

    pub fn tick_to_secs(&self, tick: u64) -> f64 {
        self.tick_to_us(tick) / 1_000_000.0
    }
}

/// All Set Tempo events as (absolute tick, µs per quarter note), track by track.
fn tempo_events(smf: &Smf<'_>) -> Vec<(u64, f64)> {
    let mut out = Vec::new();
    for tr in &smf.tracks {
        let mut abs_ticks: u64 = 0;
        for ev in tr {
            abs_ticks += ev.delta.as_int() as u64;
            if let TrackEventKind::Meta(MetaMessage::Tempo(tp)) = ev.kind {
                out.push((abs_ticks, tp.as_int() as f64));
            }
        }
    }
    out
}

/// Every tempo the file declares, in BPM. Empty when the file has no Set Tempo event.
pub fn tempo_changes_bpm(smf: &Smf<'_>) -> Vec<f64> {
    tempo_events(smf)
        .into_iter()
        .filter(|&(_, us)| us > 0.0)
        .map(|(_, us)| 60_000_000.0 / us)
        .collect()
}

/// Pair NoteOn/NoteOff events into notes across all tracks and channels.
///
/// A note-off closes every open note of the same channel and key in its track that started at an
/// earlier tick. When all of them started on this very tick, only the oldest one closes.
/// Notes left open at the end of a track are dropped.
pub fn collect_notes(smf: &Smf<'_>) -> Vec<Note> {
    let tempo = TempoMap::from_smf(smf);
    let mut notes = Vec::new();

    for tr in &smf.tracks {
        let mut abs_ticks: u64 = 0;
        let mut open: HashMap<(u8, u8), Vec<u64>> = HashMap::new();

        for ev in tr {
            abs_ticks += ev.delta.as_int() as u64;
            let TrackEventKind::Midi { channel, message } = ev.kind else { continue };
            let ch = channel.as_int();

            let key = match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                    open.entry((ch, key.as_int())).or_default().push(abs_ticks);
                    continue;
                }
                MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => key.as_int(),
                _ => continue,
            };

            let Some(starts) = open.get_mut(&(ch, key)) else { continue };
            if starts.is_empty() {
                continue;
            }

            let (earlier, same_tick): (Vec<u64>, Vec<u64>) =
                starts.iter().copied().partition(|&s| s < abs_ticks);
            let closing = if earlier.is_empty() {
                *starts = same_tick[1..].to_vec();
                vec![same_tick[0]]
            } else {
                *starts = same_tick;
                earlier
            };

            let end = tempo.tick_to_secs(abs_ticks);
            for start_tick in closing {
                notes.push(Note { pitch: key, start: tempo.tick_to_secs(start_tick), end });
            }
        }
    }

    notes
}

/// Build a linear timeline of events from a parsed MIDI file.
///
/// - Walk each track, accumulating delta ticks into absolute ticks
/// - Convert ticks into microseconds through the shared tempo map
/// - Collect channel messages into our `Msg` enum (NoteOn velocity 0 becomes NoteOff)
/// - Merge all tracks into one chronological event list
pub fn build_timeline(smf: &Smf<'_>) -> Timeline {
    let tempo = TempoMap::from_smf(smf);
    let mut events = Vec::new();

    for tr in &smf.tracks {
        let mut abs_ticks: u64 = 0;

        for ev in tr {
            abs_ticks += ev.delta.as_int() as u64;
            let TrackEventKind::Midi { channel, message } = ev.kind else { continue };
            let ch = channel.as_int();
            let t_us = tempo.tick_to_us(abs_ticks) as u64;

            use MidiMessage::*;
            let msg = match message {
                NoteOn { key, vel } if vel.as_int() == 0 => Msg::NoteOff(ch, key.as_int()),
                NoteOn { key, vel } => Msg::NoteOn(ch, key.as_int(), vel.as_int()),
                NoteOff { key, .. } => Msg::NoteOff(ch, key.as_int()),
                ProgramChange { program } => Msg::Program(ch, program.as_int()),
                Controller { controller, value } => Msg::Control(ch, controller.as_int(), value.as_int()),
                PitchBend { bend } => Msg::PitchBend(ch, bend.0.as_int()),
                Aftertouch { key, vel } => Msg::AfterTouch(ch, key.as_int(), vel.as_int()),
                ChannelAftertouch { vel } => Msg::ChannelAftertouch(ch, vel.as_int()),
            };
            events.push(Timed { t_us, msg });
        }
    }

    // Stable sort keeps per-track order for simultaneous events
    events.sort_by_key(|e| e.t_us);
    let last_t_us = events.last().map(|e| e.t_us).unwrap_or(0);

    Timeline { events, last_t_us }
}

/// Format a microsecond timestamp as MM:SS string for logging/debugging.
pub fn format_duration(us: u64) -> String {
    let total_secs = us / 1_000_000;
    let mins = total_secs / 60;
    let secs = total_secs % 60;
    format!("{:02}:{:02}", mins, secs)
}
