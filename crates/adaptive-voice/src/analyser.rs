//! Level analysis for the monitor tick.
//!
//! Reproduces what a browser analyser node reports through its byte frequency data:
//! Blackman window, FFT, magnitude normalised by N, smoothing over time, conversion
//! to dB and a linear map of `[min_db, max_db]` onto `0..=255`. The tick level is the
//! mean over the N/2 bins, so the VAD thresholds keep their tuned meaning.

use crate::config::AnalyserConfig;
use crate::error::VoiceResult;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Reads the instantaneous energy level of a live stream.
///
/// `Err(VoiceError::StreamClosed)` means the stream is gone for good; any other
/// error only spoils the current tick.
pub trait LevelSampler {
    fn sample_level(&mut self) -> VoiceResult<f32>;
}

/// Fixed-size ring of the most recent PCM samples.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    buf: Vec<f32>,
    head: usize,
}

impl SampleWindow {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0.0; size.max(1)],
            head: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push_slice(&mut self, samples: &[f32]) {
        let n = self.buf.len();
        // Only the newest `n` samples can survive.
        let samples = if samples.len() > n {
            &samples[samples.len() - n..]
        } else {
            samples
        };
        for &s in samples {
            self.buf[self.head] = s;
            self.head = (self.head + 1) % n;
        }
    }

    /// Copy the window oldest-first into `out` (must be `len()` long).
    pub fn copy_ordered(&self, out: &mut [f32]) {
        let (newer, older) = self.buf.split_at(self.head);
        out[..older.len()].copy_from_slice(older);
        out[older.len()..].copy_from_slice(newer);
    }

    pub fn clear(&mut self) {
        self.buf.iter_mut().for_each(|s| *s = 0.0);
        self.head = 0;
    }
}

/// Browser-style spectrum analyser producing one 0–255 level per call.
pub struct SpectrumAnalyser {
    config: AnalyserConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    ordered: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl std::fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyser")
            .field("config", &self.config)
            .finish()
    }
}

impl SpectrumAnalyser {
    pub fn new(config: AnalyserConfig) -> Self {
        let n = config.fft_size;
        let fft = FftPlanner::<f32>::new().plan_fft_forward(n);
        let window = blackman(n);
        Self {
            smoothed: vec![0.0; n / 2],
            ordered: vec![0.0; n],
            scratch: vec![Complex::new(0.0, 0.0); n],
            fft,
            window,
            config,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.config.fft_size
    }

    /// Per-bin byte values for the current window (updates smoothing state).
    pub fn byte_frequency_data(&mut self, window: &SampleWindow, out: &mut Vec<u8>) {
        let n = self.config.fft_size;
        window.copy_ordered(&mut self.ordered);

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            *slot = Complex::new(self.ordered[i] * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let tau = self.config.smoothing;
        let scale = 255.0 / (self.config.max_db - self.config.min_db);
        out.clear();
        for (k, prev) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.scratch[k].norm() / n as f32;
            let value = tau * *prev + (1.0 - tau) * magnitude;
            *prev = if value.is_finite() { value } else { 0.0 };

            let db = 20.0 * prev.log10();
            let byte = ((db - self.config.min_db) * scale).floor();
            out.push(if byte.is_finite() { byte.clamp(0.0, 255.0) as u8 } else { 0 });
        }
    }

    /// Mean byte level over all bins.
    pub fn level(&mut self, window: &SampleWindow) -> f32 {
        let mut bytes = Vec::with_capacity(self.smoothed.len());
        self.byte_frequency_data(window, &mut bytes);
        if bytes.is_empty() {
            return 0.0;
        }
        bytes.iter().map(|&b| b as f32).sum::<f32>() / bytes.len() as f32
    }

    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }
}

fn blackman(n: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            A0 - A1 * (2.0 * PI * x).cos() + A2 * (4.0 * PI * x).cos()
        })
        .collect()
}
