//! spectral.rs
//!
//! Whole-signal spectral descriptors for an audio file: the mean of each Mel-frequency
//! cepstral coefficient (MFCC) over all frames, and the mean spectral centroid.
//!
//! The pipeline follows the usual librosa defaults so numbers are comparable with the
//! Python tooling people already use:
//!  - mono downmix at the file's native sample rate
//!  - STFT with a 2048-point periodic Hann window, hop 512, frames centred by zero padding
//!  - power spectrogram → 128-band Slaney mel filterbank → dB (floor 1e-10, 80 dB range)
//!  - orthonormal DCT-II, keep the first `n_mfcc` coefficients
//!  - spectral centroid from the magnitude spectrogram

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::LyrgenError;

pub const DEFAULT_N_MFCC: usize = 13;

/// Analysis parameters.
#[derive(Clone, Debug)]
pub struct SpectralConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub n_mfcc: usize,
    /// Dynamic range kept by the dB conversion; `None` keeps everything
    pub top_db: Option<f64>,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self { n_fft: 2048, hop_length: 512, n_mels: 128, n_mfcc: DEFAULT_N_MFCC, top_db: Some(80.0) }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpectralFeatures {
    pub mfcc_mean: Vec<f64>,
    pub spectral_centroid_mean: f64,
}

/// Mono samples in [-1, 1] at their native rate.
#[derive(Clone, Debug)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Result of looking for the audio render that sits next to a MIDI file.
#[derive(Clone, Debug, PartialEq)]
pub enum Companion {
    Loaded(SpectralFeatures),
    Missing,
    Unreadable(String),
}

impl Companion {
    /// Features to attach to a record; empty coefficients and 0.0 when nothing loaded.
    pub fn into_features(self) -> SpectralFeatures {
        match self {
            Companion::Loaded(f) => f,
            Companion::Missing | Companion::Unreadable(_) => SpectralFeatures::default(),
        }
    }
}

/// `song.mid` → `song.wav`, in the same directory.
pub fn companion_path(midi_path: &Path) -> PathBuf {
    midi_path.with_extension("wav")
}

/// Load a WAV file and downmix it to mono.
pub fn load_audio(path: &Path) -> Result<AudioClip> {
    let mut reader = hound::WavReader::open(path).with_context(|| format!("opening {:?}", path))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float if spec.bits_per_sample == 32 => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .with_context(|| format!("reading samples from {:?}", path))?,
        hound::SampleFormat::Int if (1..=32).contains(&spec.bits_per_sample) => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .with_context(|| format!("reading samples from {:?}", path))?
        }
        fmt => {
            return Err(LyrgenError::UnsupportedAudio(format!(
                "{:?} with {} bits per sample",
                fmt, spec.bits_per_sample
            ))
            .into())
        }
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    debug!(path = ?path, sample_rate = spec.sample_rate, frames = samples.len(), "loaded audio");
    Ok(AudioClip { samples, sample_rate: spec.sample_rate })
}

/// Standalone entry point: any load or analysis failure is returned to the caller.
pub fn extract_spectral_features(audio_path: &Path, n_mfcc: usize) -> Result<SpectralFeatures> {
    let clip = load_audio(audio_path)?;
    let cfg = SpectralConfig { n_mfcc, ..SpectralConfig::default() };
    analyze(&clip, &cfg).with_context(|| format!("analysing {:?}", audio_path))
}

/// Look for the companion WAV of a MIDI file and analyse it if it is there.
pub fn companion_features(midi_path: &Path, cfg: &SpectralConfig) -> Companion {
    let path = companion_path(midi_path);
    if !path.is_file() {
        debug!(path = ?path, "no companion audio");
        return Companion::Missing;
    }
    match load_audio(&path).and_then(|clip| analyze(&clip, cfg)) {
        Ok(f) => Companion::Loaded(f),
        Err(e) => {
            warn!(path = ?path, "companion audio unusable: {e:#}");
            Companion::Unreadable(format!("{e:#}"))
        }
    }
}

/// Compute MFCC means and the mean spectral centroid of a clip.
pub fn analyze(clip: &AudioClip, cfg: &SpectralConfig) -> Result<SpectralFeatures> {
    if clip.samples.is_empty() {
        return Err(LyrgenError::EmptyAudio.into());
    }
    if clip.sample_rate == 0 {
        bail!("sample rate is zero");
    }
    if cfg.n_mfcc > cfg.n_mels {
        bail!("n_mfcc ({}) cannot exceed n_mels ({})", cfg.n_mfcc, cfg.n_mels);
    }

    let stft = Stft::new(cfg.n_fft, cfg.hop_length);
    let mags = stft.magnitudes(&clip.samples);
    let sr = clip.sample_rate as f64;

    let spectral_centroid_mean = mean(mags.iter().map(|frame| centroid(frame, sr, cfg.n_fft)));

    let filters = mel_filterbank(sr, cfg.n_fft, cfg.n_mels);
    let mut mel_db: Vec<Vec<f64>> = mags
        .iter()
        .map(|frame| {
            filters
                .iter()
                .map(|w| w.iter().zip(frame).map(|(w, m)| w * m * m).sum::<f64>())
                .map(power_to_db)
                .collect()
        })
        .collect();

    if let Some(top_db) = cfg.top_db {
        let peak = mel_db.iter().flatten().copied().fold(f64::NEG_INFINITY, f64::max);
        let floor = peak - top_db;
        for v in mel_db.iter_mut().flatten() {
            *v = v.max(floor);
        }
    }

    let mut sums = vec![0.0; cfg.n_mfcc];
    for frame in &mel_db {
        for (acc, c) in sums.iter_mut().zip(dct_ortho(frame, cfg.n_mfcc)) {
            *acc += c;
        }
    }
    let n_frames = mel_db.len() as f64;
    let mfcc_mean = sums.into_iter().map(|s| s / n_frames).collect();

    Ok(SpectralFeatures { mfcc_mean, spectral_centroid_mean })
}

/// Short-time Fourier transform with a periodic Hann window and centred frames.
struct Stft {
    fft: Arc<dyn Fft<f64>>,
    n_fft: usize,
    hop: usize,
    window: Vec<f64>,
}

impl Stft {
    fn new(n_fft: usize, hop: usize) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(n_fft);
        let window = (0..n_fft)
            .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / n_fft as f64).cos())
            .collect();
        Self { fft, n_fft, hop: hop.max(1), window }
    }

    /// Magnitude spectra, one `n_fft / 2 + 1` vector per frame.
    fn magnitudes(&self, signal: &[f32]) -> Vec<Vec<f64>> {
        let pad = self.n_fft / 2;
        let mut padded = vec![0.0f64; signal.len() + 2 * pad];
        for (dst, &s) in padded[pad..].iter_mut().zip(signal) {
            *dst = s as f64;
        }

        let n_frames = 1 + (padded.len() - self.n_fft) / self.hop;
        let n_bins = self.n_fft / 2 + 1;
        let mut buffer = vec![Complex::new(0.0, 0.0); self.n_fft];
        let mut out = Vec::with_capacity(n_frames);

        for f in 0..n_frames {
            let start = f * self.hop;
            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buffer);
            out.push(buffer[..n_bins].iter().map(|c| c.norm()).collect());
        }
        out
    }
}

fn centroid(frame: &[f64], sr: f64, n_fft: usize) -> f64 {
    let total: f64 = frame.iter().sum();
    if total <= f64::MIN_POSITIVE {
        return 0.0;
    }
    let bin_hz = sr / n_fft as f64;
    frame.iter().enumerate().map(|(k, m)| k as f64 * bin_hz * m).sum::<f64>() / total
}

fn power_to_db(power: f64) -> f64 {
    // amin 1e-10, reference power 1.0
    10.0 * power.max(1e-10).log10()
}

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

/// Slaney mel scale: linear below 1 kHz, logarithmic above.
fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Triangular filters from 0 Hz to Nyquist, area-normalised (Slaney), `n_mels` × `n_fft / 2 + 1`.
fn mel_filterbank(sr: f64, n_fft: usize, n_mels: usize) -> Vec<Vec<f64>> {
    let n_bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_bins).map(|k| k as f64 * sr / n_fft as f64).collect();

    let mel_max = hz_to_mel(sr / 2.0);
    let mel_f: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (lo, mid, hi) = (mel_f[m], mel_f[m + 1], mel_f[m + 2]);
            let enorm = 2.0 / (hi - lo);
            fft_freqs
                .iter()
                .map(|&f| {
                    let lower = (f - lo) / (mid - lo);
                    let upper = (hi - f) / (hi - mid);
                    lower.min(upper).max(0.0) * enorm
                })
                .collect()
        })
        .collect()
}

/// First `n_out` coefficients of the orthonormal DCT-II of `x`.
fn dct_ortho(x: &[f64], n_out: usize) -> Vec<f64> {
    let n = x.len() as f64;
    (0..n_out)
        .map(|k| {
            let sum: f64 = x
                .iter()
                .enumerate()
                .map(|(i, v)| v * (std::f64::consts::PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos())
                .sum();
            let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            sum * scale
        })
        .collect()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[f32]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            w.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        w.finalize().unwrap();
    }

    pub(crate) fn sine(freq: f32, sample_rate: u32, secs: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * secs) as usize;
        (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn mel_scale_is_linear_then_log() {
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
        assert!((hz_to_mel(500.0) - 7.5).abs() < 1e-9);
        for hz in [100.0, 999.0, 1000.0, 4000.0, 11025.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
    }

    #[test]
    fn filterbank_shape_and_peaks() {
        let fb = mel_filterbank(22050.0, 2048, 128);
        assert_eq!(fb.len(), 128);
        assert!(fb.iter().all(|row| row.len() == 1025));
        assert!(fb.iter().flatten().all(|&w| w >= 0.0));

        let peak_bin = |row: &Vec<f64>| {
            row.iter().enumerate().max_by(|a, b| a.1.partial_cmp(b.1).unwrap()).map(|(i, _)| i).unwrap()
        };
        let peaks: Vec<usize> = fb.iter().map(peak_bin).collect();
        assert!(peaks.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn dct_of_constant_only_has_dc() {
        let c = dct_ortho(&[2.0; 8], 4);
        assert!((c[0] - 2.0 * 8f64.sqrt()).abs() < 1e-9);
        assert!(c[1..].iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn silence_hits_the_db_floor() {
        let clip = AudioClip { samples: vec![0.0; 4096], sample_rate: 22050 };
        let f = analyze(&clip, &SpectralConfig::default()).unwrap();
        assert_eq!(f.mfcc_mean.len(), 13);
        assert!((f.mfcc_mean[0] + 100.0 * 128f64.sqrt()).abs() < 1e-6);
        assert!(f.mfcc_mean[1..].iter().all(|v| v.abs() < 1e-6));
        assert_eq!(f.spectral_centroid_mean, 0.0);
    }

    #[test]
    fn centroid_tracks_a_pure_tone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 22050, 1, &sine(1000.0, 22050, 2.0));

        let f = extract_spectral_features(&path, 13).unwrap();
        assert_eq!(f.mfcc_mean.len(), 13);
        assert!((900.0..1250.0).contains(&f.spectral_centroid_mean), "{}", f.spectral_centroid_mean);
    }

    #[test]
    fn stereo_is_downmixed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 8000, 2, &[0.5, -0.5, 0.25, 0.25]);
        let clip = load_audio(&path).unwrap();
        assert_eq!(clip.samples.len(), 2);
        assert!(clip.samples[0].abs() < 1e-3);
        assert!((clip.samples[1] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn double_precision_wav_is_unsupported() {
        // WAVE_FORMAT_EXTENSIBLE, IEEE float subformat, mono 8 kHz, 64-bit samples
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&76u32.to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&40u32.to_le_bytes());
        bytes.extend_from_slice(&0xFFFEu16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&8000u32.to_le_bytes());
        bytes.extend_from_slice(&64_000u32.to_le_bytes());
        bytes.extend_from_slice(&8u16.to_le_bytes());
        bytes.extend_from_slice(&64u16.to_le_bytes());
        bytes.extend_from_slice(&22u16.to_le_bytes());
        bytes.extend_from_slice(&64u16.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&[
            0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b, 0x71,
        ]);
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);

        let dir = tempdir().unwrap();
        let path = dir.path().join("f64.wav");
        std::fs::write(&path, &bytes).unwrap();

        let err = load_audio(&path).unwrap_err();
        assert!(matches!(err.downcast_ref::<LyrgenError>(), Some(LyrgenError::UnsupportedAudio(_))));
        assert!(extract_spectral_features(&path, 13).is_err());
        let companion = companion_features(&dir.path().join("f64.mid"), &SpectralConfig::default());
        assert!(matches!(companion, Companion::Unreadable(_)));
    }

    #[test]
    fn custom_coefficient_count() {
        let clip = AudioClip { samples: sine(440.0, 16000, 0.5), sample_rate: 16000 };
        let cfg = SpectralConfig { n_mfcc: 20, ..SpectralConfig::default() };
        assert_eq!(analyze(&clip, &cfg).unwrap().mfcc_mean.len(), 20);
    }

    #[test]
    fn standalone_extraction_fails_hard() {
        let dir = tempdir().unwrap();
        assert!(extract_spectral_features(&dir.path().join("nope.wav"), 13).is_err());

        let empty = dir.path().join("empty.wav");
        write_wav(&empty, 22050, 1, &[]);
        let err = extract_spectral_features(&empty, 13).unwrap_err();
        assert!(matches!(err.downcast_ref::<LyrgenError>(), Some(LyrgenError::EmptyAudio)));
    }

    #[test]
    fn companion_lookup_is_fail_soft() {
        let dir = tempdir().unwrap();
        let midi = dir.path().join("song.mid");
        assert_eq!(companion_path(&midi), dir.path().join("song.wav"));
        assert_eq!(companion_features(&midi, &SpectralConfig::default()), Companion::Missing);

        std::fs::write(dir.path().join("song.wav"), b"RIFF garbage").unwrap();
        let c = companion_features(&midi, &SpectralConfig::default());
        assert!(matches!(c, Companion::Unreadable(_)));
        assert_eq!(c.into_features(), SpectralFeatures::default());
    }

    #[test]
    fn companion_is_analysed_when_present() {
        let dir = tempdir().unwrap();
        let midi = dir.path().join("take.mid");
        write_wav(&companion_path(&midi), 22050, 1, &sine(2000.0, 22050, 0.5));
        match companion_features(&midi, &SpectralConfig::default()) {
            Companion::Loaded(f) => {
                assert_eq!(f.mfcc_mean.len(), 13);
                assert!(f.spectral_centroid_mean > 1500.0);
            }
            other => panic!("expected features, got {other:?}"),
        }
    }
}
