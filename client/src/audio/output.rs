//! Clocked audio outputs the playback scheduler writes into.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

use super::pcm::{resample_linear, AudioBuffer};

/// An output with a monotonically increasing clock in seconds. Buffers are
/// placed at absolute times on that clock.
pub trait AudioOutput: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Current time on the output clock.
    fn now(&self) -> f64;

    /// Start `buffer` at `start` seconds on the output clock.
    fn schedule(&self, buffer: AudioBuffer, start: f64);

    /// The last `n` samples of what the output is playing, mixed.
    fn recent_samples(&self, n: usize) -> Vec<f32>;

    /// Cancel every buffer that has not finished yet.
    fn stop_all(&self);

    fn close(&self);
}

struct Scheduled {
    start: u64,
    samples: Vec<f32>,
}

impl Scheduled {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Buffers placed on a frame-indexed timeline and mixed on demand.
pub(crate) struct Timeline {
    rate: u32,
    frames_played: u64,
    buffers: Vec<Scheduled>,
    keep_frames: u64,
}

impl Timeline {
    pub(crate) fn new(rate: u32, keep_frames: usize) -> Self {
        Self {
            rate: rate.max(1),
            frames_played: 0,
            buffers: Vec::new(),
            keep_frames: keep_frames as u64,
        }
    }

    pub(crate) fn rate(&self) -> u32 {
        self.rate
    }

    pub(crate) fn now(&self) -> f64 {
        self.frames_played as f64 / self.rate as f64
    }

    pub(crate) fn frames_played(&self) -> u64 {
        self.frames_played
    }

    pub(crate) fn schedule(&mut self, buffer: AudioBuffer, start: f64) {
        let samples = resample_linear(&buffer.samples, buffer.sample_rate, self.rate);
        let start = (start.max(0.0) * self.rate as f64).round() as u64;
        self.buffers.push(Scheduled { start, samples });
    }

    /// Mix the next `out.len()` frames and advance the clock.
    pub(crate) fn render(&mut self, out: &mut [f32]) {
        let from = self.frames_played;
        self.mix_into(from, out);
        self.advance_to(from + out.len() as u64);
    }

    /// Move the clock forward without producing output.
    pub(crate) fn advance_to(&mut self, frame: u64) {
        if frame <= self.frames_played {
            return;
        }
        self.frames_played = frame;
        let horizon = frame.saturating_sub(self.keep_frames);
        self.buffers.retain(|b| b.end() > horizon);
    }

    /// The mix of the `n` frames that ended at `end_frame`.
    pub(crate) fn window(&self, end_frame: u64, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; n];
        self.mix_into(end_frame.saturating_sub(n as u64), &mut out);
        out
    }

    pub(crate) fn clear(&mut self) {
        self.buffers.clear();
    }

    pub(crate) fn pending(&self) -> usize {
        let now = self.frames_played;
        self.buffers.iter().filter(|b| b.end() > now).count()
    }

    fn mix_into(&self, from: u64, out: &mut [f32]) {
        out.fill(0.0);
        let to = from + out.len() as u64;
        for buffer in &self.buffers {
            let lo = buffer.start.max(from);
            let hi = buffer.end().min(to);
            if lo >= hi {
                continue;
            }
            for frame in lo..hi {
                out[(frame - from) as usize] += buffer.samples[(frame - buffer.start) as usize];
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
}

/// Output driven by the tokio clock instead of a sound card. Scheduled audio
/// is timed and metered but never heard. Used headless and as the fallback
/// when no output device can be opened.
pub struct ClockOutput {
    epoch: Instant,
    timeline: Mutex<Timeline>,
    closed: AtomicBool,
}

impl ClockOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            epoch: Instant::now(),
            timeline: Mutex::new(Timeline::new(sample_rate, sample_rate as usize)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Buffers that have not finished playing yet.
    pub fn pending(&self) -> usize {
        let mut timeline = self.timeline.lock();
        let frame = self.current_frame(timeline.rate());
        timeline.advance_to(frame);
        timeline.pending()
    }

    fn current_frame(&self, rate: u32) -> u64 {
        (self.epoch.elapsed().as_secs_f64() * rate as f64).floor() as u64
    }
}

impl AudioOutput for ClockOutput {
    fn sample_rate(&self) -> u32 {
        self.timeline.lock().rate()
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn schedule(&self, buffer: AudioBuffer, start: f64) {
        if self.is_closed() {
            return;
        }
        let mut timeline = self.timeline.lock();
        let frame = self.current_frame(timeline.rate());
        timeline.advance_to(frame);
        timeline.schedule(buffer, start);
    }

    fn recent_samples(&self, n: usize) -> Vec<f32> {
        let mut timeline = self.timeline.lock();
        let frame = self.current_frame(timeline.rate());
        timeline.advance_to(frame);
        timeline.window(timeline.frames_played(), n)
    }

    fn stop_all(&self) {
        self.timeline.lock().clear();
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stop_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn buffer(rate: u32, samples: Vec<f32>) -> AudioBuffer {
        AudioBuffer {
            sample_rate: rate,
            samples,
        }
    }

    #[test]
    fn test_timeline_mixes_back_to_back_buffers() {
        let mut timeline = Timeline::new(4, 8);
        timeline.schedule(buffer(4, vec![0.1, 0.1]), 0.0);
        timeline.schedule(buffer(4, vec![0.2, 0.2]), 0.5);
        let mut out = [0.0; 6];
        timeline.render(&mut out);
        assert_eq!(out, [0.1, 0.1, 0.2, 0.2, 0.0, 0.0]);
        assert!((timeline.now() - 1.5).abs() < 1e-9);
        assert_eq!(timeline.window(4, 3), vec![0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_timeline_resamples_to_its_rate() {
        let mut timeline = Timeline::new(8, 8);
        timeline.schedule(buffer(4, vec![0.5; 4]), 0.0);
        let mut out = [0.0; 10];
        timeline.render(&mut out);
        assert_eq!(out.iter().filter(|s| **s > 0.0).count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_output_tracks_time() {
        let output = ClockOutput::new(1_000);
        assert!(output.now() < 1e-6);
        output.schedule(buffer(1_000, vec![0.5; 500]), 0.25);
        assert_eq!(output.pending(), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!((output.now() - 0.5).abs() < 1e-3);
        let recent = output.recent_samples(100);
        assert!(recent.iter().all(|s| (*s - 0.5).abs() < 1e-6));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(output.pending(), 0);

        output.close();
        output.schedule(buffer(1_000, vec![0.5; 10]), 2.0);
        assert!(output.is_closed());
        assert_eq!(output.pending(), 0);
    }
}
