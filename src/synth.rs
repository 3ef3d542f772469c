//! synth.rs
//!
//! Offline rendering of a MIDI file into the companion WAV that spectral analysis reads.
//!
//! - **FluidLite** is a lightweight software synthesizer that loads a General MIDI SoundFont
//!   and renders raw PCM from MIDI events.
//! - Rendering is not real time: we walk the pre-built `Timeline`, and between two events
//!   ask the synth for exactly as many frames as the gap lasts. Then the event is applied.
//! - The result is written as a 32-bit float stereo WAV with `hound`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fluidlite::{Settings, Synth};
use tracing::info;

use crate::midi::{self, format_duration, Msg, Timeline};
use crate::spectral::companion_path;

#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub sample_rate: u32,
    /// Silence rendered after the last event so release tails and reverb ring out
    pub tail_secs: f64,
    pub gain: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { sample_rate: 44_100, tail_secs: 1.0, gain: 0.7 }
    }
}

/// Anything that accepts MIDI messages and produces interleaved stereo frames.
pub trait MidiSink {
    fn apply(&mut self, msg: Msg);
    fn write(&mut self, out: &mut [f32]) -> Result<()>;
}

/// FluidLite synth with a SoundFont loaded and effects set up.
pub struct FluidSink {
    synth: Synth,
}

impl FluidSink {
    pub fn new(soundfont: &Path, cfg: &RenderConfig) -> Result<Self> {
        let settings = Settings::new()?;
        let synth = Synth::new(settings)?;
        synth
            .sfload(soundfont, true)
            .with_context(|| format!("loading soundfont {:?}", soundfont))?;

        synth.set_sample_rate(cfg.sample_rate as f32);
        synth.set_gain(cfg.gain);
        synth.set_reverb_on(true);
        synth.set_reverb_params(0.7, 0.2, 0.9, 0.5);
        synth.set_chorus_on(true);
        synth.set_chorus_params(3, 1.2, 0.30, 8.0, Default::default());

        for ch in 0..16u32 {
            let _ = synth.pitch_bend(ch, 8192); // center
            let _ = synth.cc(ch, 121, 0); // Reset All Controllers
        }
        Ok(Self { synth })
    }
}

impl MidiSink for FluidSink {
    fn apply(&mut self, msg: Msg) {
        // FluidLite reports e.g. a note-off without a sounding note as an error; harmless here
        let s = &self.synth;
        let _ = match msg {
            Msg::NoteOn(ch, key, vel) => s.note_on(ch as u32, key as u32, vel as u32),
            Msg::NoteOff(ch, key) => s.note_off(ch as u32, key as u32),
            Msg::Program(ch, prog) => s.program_change(ch as u32, prog as u32),
            Msg::Control(ch, cc, val) => s.cc(ch as u32, cc as u32, val as u32),
            Msg::PitchBend(ch, bend) => s.pitch_bend(ch as u32, bend as u32),
            Msg::AfterTouch(ch, key, vel) => s.key_pressure(ch as u32, key as u32, vel as u32),
            Msg::ChannelAftertouch(ch, vel) => s.channel_pressure(ch as u32, vel as u32),
        };
    }

    fn write(&mut self, out: &mut [f32]) -> Result<()> {
        self.synth.write(out)?;
        Ok(())
    }
}

/// Render a timeline into interleaved stereo samples.
pub fn render_timeline<S: MidiSink>(sink: &mut S, tl: &Timeline, cfg: &RenderConfig) -> Result<Vec<f32>> {
    let sr = cfg.sample_rate as f64;
    let total_frames = ((tl.last_t_us as f64 / 1_000_000.0 + cfg.tail_secs.max(0.0)) * sr).ceil() as usize;
    let mut out = vec![0.0f32; total_frames * 2];
    let mut cursor = 0usize;

    for ev in &tl.events {
        let frame = ((ev.t_us as f64 * sr / 1_000_000.0) as usize).min(total_frames);
        if frame > cursor {
            sink.write(&mut out[cursor * 2..frame * 2])?;
            cursor = frame;
        }
        sink.apply(ev.msg);
    }
    if cursor < total_frames {
        sink.write(&mut out[cursor * 2..])?;
    }
    Ok(out)
}

pub fn write_stereo_wav(path: &Path, sample_rate: u32, samples: &[f32]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut w = hound::WavWriter::create(path, spec).with_context(|| format!("creating {:?}", path))?;
    for &s in samples {
        w.write_sample(s)?;
    }
    w.finalize()?;
    Ok(())
}

/// Render `midi_path` through `soundfont` into its companion WAV and return that path.
pub fn render_companion(midi_path: &Path, soundfont: &Path, cfg: &RenderConfig) -> Result<PathBuf> {
    let bytes = fs::read(midi_path).with_context(|| format!("reading {:?}", midi_path))?;
    let smf = midi::parse(&bytes)?;
    let tl = midi::build_timeline(&smf);

    let mut sink = FluidSink::new(soundfont, cfg)?;
    let samples = render_timeline(&mut sink, &tl, cfg)?;

    let out = companion_path(midi_path);
    write_stereo_wav(&out, cfg.sample_rate, &samples)?;
    info!(
        path = ?out,
        events = tl.events.len(),
        length = %format_duration(tl.last_t_us),
        "rendered companion audio"
    );
    Ok(out)
}
