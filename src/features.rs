//! features.rs
//!
//! Numeric summary of a MIDI file used to seed lyric generation.
//!
//! Extraction never fails: an unreadable or malformed file yields the zeroed record,
//! wrapped in [`FeatureOutcome::Defaulted`] so callers can still tell it apart from a
//! file that parsed but happened to be empty.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::midi::{self, Note};
use crate::spectral::{self, SpectralConfig, SpectralFeatures};

/// One histogram bin per MIDI key number.
pub const PITCH_BINS: usize = 128;

/// Features of one MIDI file. Read-only once built.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeatureRecord {
    tempo: f64,
    pitch_hist: Vec<u64>,
    avg_duration: f64,
    mfcc_mean: Vec<f64>,
    spectral_centroid_mean: f64,
}

impl Default for FeatureRecord {
    fn default() -> Self {
        Self {
            tempo: 0.0,
            pitch_hist: vec![0; PITCH_BINS],
            avg_duration: 0.0,
            mfcc_mean: Vec::new(),
            spectral_centroid_mean: 0.0,
        }
    }
}

impl FeatureRecord {
    /// Summarise tempo events (in BPM) and finished notes.
    pub fn from_notes(tempi_bpm: &[f64], notes: &[Note]) -> Self {
        let mut pitch_hist = vec![0u64; PITCH_BINS];
        for n in notes {
            // midly keys are 7-bit, always in range
            pitch_hist[n.pitch as usize & 0x7F] += 1;
        }

        Self {
            tempo: mean(tempi_bpm.iter().copied()),
            pitch_hist,
            avg_duration: mean(notes.iter().map(Note::duration)),
            ..Self::default()
        }
    }

    pub fn with_spectral(self, spectral: SpectralFeatures) -> Self {
        Self {
            mfcc_mean: spectral.mfcc_mean,
            spectral_centroid_mean: spectral.spectral_centroid_mean,
            ..self
        }
    }

    /// Mean BPM over all tempo events, 0.0 when there are none.
    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Always `PITCH_BINS` long.
    pub fn pitch_hist(&self) -> &[u64] {
        &self.pitch_hist
    }

    /// Mean note length in seconds, 0.0 without notes.
    pub fn avg_duration(&self) -> f64 {
        self.avg_duration
    }

    pub fn mfcc_mean(&self) -> &[f64] {
        &self.mfcc_mean
    }

    pub fn spectral_centroid_mean(&self) -> f64 {
        self.spectral_centroid_mean
    }

    pub fn note_count(&self) -> u64 {
        self.pitch_hist.iter().sum()
    }
}

/// What MIDI extraction produced.
#[derive(Clone, Debug, PartialEq)]
pub enum FeatureOutcome {
    /// The file parsed; the record holds real data (possibly zero notes).
    Parsed(FeatureRecord),
    /// The file could not be read or parsed; the record is all defaults.
    Defaulted { record: FeatureRecord, cause: String },
}

impl FeatureOutcome {
    pub fn record(&self) -> &FeatureRecord {
        match self {
            FeatureOutcome::Parsed(r) | FeatureOutcome::Defaulted { record: r, .. } => r,
        }
    }

    pub fn into_record(self) -> FeatureRecord {
        match self {
            FeatureOutcome::Parsed(r) | FeatureOutcome::Defaulted { record: r, .. } => r,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, FeatureOutcome::Parsed(_))
    }
}

/// Extract features from a MIDI file, plus spectral features of its companion WAV.
pub fn extract_midi_features(midi_path: &Path) -> FeatureOutcome {
    extract_midi_features_with(midi_path, &SpectralConfig::default())
}

pub fn extract_midi_features_with(midi_path: &Path, cfg: &SpectralConfig) -> FeatureOutcome {
    let record = match read_midi(midi_path) {
        Ok(r) => r,
        Err(e) => {
            warn!(path = ?midi_path, "MIDI unusable, substituting defaults: {e:#}");
            return FeatureOutcome::Defaulted { record: FeatureRecord::default(), cause: format!("{e:#}") };
        }
    };

    let spectral = spectral::companion_features(midi_path, cfg).into_features();
    let record = record.with_spectral(spectral);
    info!(
        tempo = record.tempo(),
        notes = record.note_count(),
        avg_duration = record.avg_duration(),
        "extracted MIDI features"
    );
    FeatureOutcome::Parsed(record)
}

fn read_midi(path: &Path) -> Result<FeatureRecord> {
    let bytes = fs::read(path).with_context(|| format!("reading {:?}", path))?;
    let smf = midi::parse(&bytes)?;
    let tempi = midi::tempo_changes_bpm(&smf);
    let notes = midi::collect_notes(&smf);
    debug!(tracks = smf.tracks.len(), tempo_events = tempi.len(), notes = notes.len(), "parsed MIDI");
    Ok(FeatureRecord::from_notes(&tempi, &notes))
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}
