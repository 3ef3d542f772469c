//! Lyric generation seeded by MIDI features.
//!
//! A MIDI file is summarised into a [`FeatureRecord`] (mean tempo, 128-bin pitch
//! histogram, mean note length, and spectral descriptors of a companion WAV when there
//! is one). The record and a prompt become a seed sentence that a pretrained causal
//! language model continues.
//!
//! - [`features`] — MIDI → [`FeatureRecord`], never failing
//! - [`midi`] — SMF parsing, tempo map, note pairing, playback timeline
//! - [`spectral`] — MFCC and spectral centroid means of a WAV
//! - [`synth`] — offline FluidLite render of the companion WAV
//! - [`generator`] — seed formatting and the tokenizer/model seams
//! - [`sampling`] — temperature, top-k and nucleus sampling
//! - [`model`] — Hugging Face tokenizer + ONNX Runtime backend

pub mod error;
pub mod features;
pub mod generator;
pub mod midi;
pub mod model;
pub mod sampling;
pub mod spectral;
pub mod synth;

pub use error::LyrgenError;
pub use features::{extract_midi_features, FeatureOutcome, FeatureRecord, PITCH_BINS};
pub use generator::{GenerationParams, LanguageModel, LyricGenerator, ModelSlot, TextTokenizer};
pub use spectral::{extract_spectral_features, SpectralFeatures};
