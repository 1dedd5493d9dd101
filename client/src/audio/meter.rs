//! Scalar loudness for the speaking indicator.
//!
//! Mirrors a browser analyser node: Blackman window, FFT, per-bin smoothing,
//! decibels mapped onto 0..=255, then the mean over all bins.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;

pub struct AmplitudeMeter {
    size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl AmplitudeMeter {
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);
        let window = (0..size)
            .map(|i| {
                let x = i as f32 / size as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        Self {
            size,
            fft,
            window,
            smoothed: vec![0.0; size / 2],
            scratch: vec![Complex::new(0.0, 0.0); size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Feed the most recent output samples and get a level in `0.0..=255.0`.
    /// Uses the last `size` samples, zero-padded at the front if short.
    pub fn level(&mut self, recent: &[f32]) -> f32 {
        let take = recent.len().min(self.size);
        let offset = self.size - take;
        for slot in self.scratch.iter_mut() {
            *slot = Complex::new(0.0, 0.0);
        }
        for (i, sample) in recent[recent.len() - take..].iter().enumerate() {
            let idx = offset + i;
            self.scratch[idx] = Complex::new(sample * self.window[idx], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let bins = self.smoothed.len();
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let mut sum = 0.0;
        for (bin, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.scratch[bin].norm() / self.size as f32;
            *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;
            let db = if *smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                MIN_DECIBELS
            };
            sum += (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0);
        }
        sum / bins as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        let mut meter = AmplitudeMeter::new(256);
        assert_eq!(meter.level(&[0.0; 256]), 0.0);
        assert_eq!(meter.level(&[]), 0.0);
    }

    #[test]
    fn test_tone_raises_level() {
        let mut meter = AmplitudeMeter::new(256);
        let tone: Vec<f32> = (0..1024)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / 24_000.0).sin() * 0.8)
            .collect();
        let mut level = 0.0;
        for _ in 0..10 {
            level = meter.level(&tone);
        }
        assert!(level > 0.0);
        assert!(level <= 255.0);
    }
}
