//! Log-mel statistics embedder.
//!
//! The always-available fallback backend: per-band mean and standard
//! deviation of a log-mel spectrogram, concatenated and unit-normalized.
//! Two windows of the same voice land close in cosine space because the
//! statistics capture the spectral envelope rather than the phonetic
//! content; it is far weaker than a trained speaker model but has no
//! model dependency at all.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::{l2_normalize, EmbeddingProvider};

const N_FFT: usize = 400;
const HOP: usize = 160;
const N_FREQ: usize = N_FFT / 2 + 1;
const N_MELS: usize = 64;

/// Output dimensionality: mean + std per mel band.
pub const EMBEDDING_DIM: usize = N_MELS * 2;

/// Windows quieter than this RMS produce no embedding.
const NEAR_SILENT_RMS: f32 = 0.0012;

pub struct SpectralEmbedder {
    fft: Arc<dyn Fft<f64>>,
    hann: Vec<f64>,
    /// `[freq_bin][mel]` triangular filter weights.
    filters: Vec<Vec<f64>>,
}

impl Default for SpectralEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectralEmbedder {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Self {
            fft: planner.plan_fft_forward(N_FFT),
            hann: hann_window(N_FFT),
            filters: mel_filter_bank(N_FREQ, N_MELS, 16_000, 0.0, 8_000.0),
        }
    }

    fn log_mel_frames(&self, window: &[f32]) -> Vec<[f64; N_MELS]> {
        let n_frames = 1 + (window.len() - N_FFT) / HOP;
        let mut frames = Vec::with_capacity(n_frames);
        let mut buf: Vec<Complex<f64>> = vec![Complex { re: 0.0, im: 0.0 }; N_FFT];

        for frame_idx in 0..n_frames {
            let start = frame_idx * HOP;
            let frame = &window[start..start + N_FFT];
            for (out, (&sample, win)) in buf.iter_mut().zip(frame.iter().zip(self.hann.iter())) {
                out.re = sample as f64 * win;
                out.im = 0.0;
            }
            self.fft.process(&mut buf);

            let mut power = [0.0f64; N_FREQ];
            for (p, c) in power.iter_mut().zip(buf.iter().take(N_FREQ)) {
                *p = c.re * c.re + c.im * c.im;
            }

            let mut mels = [0.0f64; N_MELS];
            for (m, mel) in mels.iter_mut().enumerate() {
                let mut v = 0.0f64;
                for k in 0..N_FREQ {
                    v += self.filters[k][m] * power[k];
                }
                *mel = v.max(1e-10).ln();
            }
            frames.push(mels);
        }
        frames
    }
}

impl EmbeddingProvider for SpectralEmbedder {
    fn embed(&self, window: &[f32], sample_rate: u32) -> Option<Vec<f32>> {
        if sample_rate != 16_000 {
            tracing::debug!(sample_rate, "unsupported sample rate; no embedding");
            return None;
        }
        if window.len() < N_FFT {
            return None;
        }
        let rms = {
            let sum: f64 = window.iter().map(|&s| s as f64 * s as f64).sum();
            (sum / window.len() as f64).sqrt() as f32
        };
        if rms < NEAR_SILENT_RMS {
            return None;
        }

        let frames = self.log_mel_frames(window);
        let n = frames.len() as f64;

        let mut mean = [0.0f64; N_MELS];
        for frame in &frames {
            for (acc, &v) in mean.iter_mut().zip(frame.iter()) {
                *acc += v;
            }
        }
        for acc in mean.iter_mut() {
            *acc /= n;
        }

        let mut std = [0.0f64; N_MELS];
        for frame in &frames {
            for ((acc, &v), &m) in std.iter_mut().zip(frame.iter()).zip(mean.iter()) {
                let d = v - m;
                *acc += d * d;
            }
        }

        let mut out = Vec::with_capacity(EMBEDDING_DIM);
        out.extend(mean.iter().map(|&m| m as f32));
        out.extend(std.iter().map(|&s| ((s / n).sqrt()) as f32));
        l2_normalize(&mut out);
        Some(out)
    }

    fn name(&self) -> &'static str {
        "spectral"
    }
}

fn hann_window(n: usize) -> Vec<f64> {
    let n_f = n as f64;
    (0..n)
        .map(|i| 0.5 - 0.5 * ((2.0 * std::f64::consts::PI * i as f64) / n_f).cos())
        .collect()
}

fn hertz_to_mel(freq: f64) -> f64 {
    let min_log_hertz = 1000.0;
    let min_log_mel = 15.0;
    let logstep = 27.0 / 6.4_f64.ln();
    if freq >= min_log_hertz {
        min_log_mel + (freq / min_log_hertz).ln() * logstep
    } else {
        3.0 * freq / 200.0
    }
}

fn mel_to_hertz(mels: f64) -> f64 {
    let min_log_hertz = 1000.0;
    let min_log_mel = 15.0;
    let logstep = 6.4_f64.ln() / 27.0;
    if mels >= min_log_mel {
        min_log_hertz * (logstep * (mels - min_log_mel)).exp()
    } else {
        200.0 * mels / 3.0
    }
}

/// Slaney-style triangular mel filterbank, `[freq_bin][mel]`.
fn mel_filter_bank(
    num_frequency_bins: usize,
    num_mel_filters: usize,
    sampling_rate: usize,
    min_frequency: f64,
    max_frequency: f64,
) -> Vec<Vec<f64>> {
    let mel_min = hertz_to_mel(min_frequency);
    let mel_max = hertz_to_mel(max_frequency);

    let filter_freqs: Vec<f64> = (0..num_mel_filters + 2)
        .map(|i| {
            let t = i as f64 / (num_mel_filters + 1) as f64;
            mel_to_hertz(mel_min + t * (mel_max - mel_min))
        })
        .collect();

    let nyquist = sampling_rate as f64 / 2.0;
    let fft_freqs: Vec<f64> = (0..num_frequency_bins)
        .map(|i| i as f64 / (num_frequency_bins - 1) as f64 * nyquist)
        .collect();

    let mut filters = vec![vec![0.0f64; num_mel_filters]; num_frequency_bins];
    for (f, &ff) in fft_freqs.iter().enumerate() {
        for m in 0..num_mel_filters {
            let f_left = filter_freqs[m];
            let f_center = filter_freqs[m + 1];
            let f_right = filter_freqs[m + 2];
            let down = (ff - f_left) / (f_center - f_left);
            let up = (f_right - ff) / (f_right - f_center);
            filters[f][m] = down.min(up).max(0.0);
        }
    }

    // Slaney area normalization.
    for m in 0..num_mel_filters {
        let enorm = 2.0 / (filter_freqs[m + 2] - filter_freqs[m]);
        for row in filters.iter_mut() {
            row[m] *= enorm;
        }
    }
    filters
}
