/// Gapless playback cursor on the output clock.
///
/// Every buffer starts at `max(next_start_time, now)` and pushes the cursor to
/// its own end, so buffers never overlap and nothing is scheduled in the
/// past. After an underrun the cursor snaps to `now` instead of accumulating
/// lag.
#[derive(Debug, Clone, Default)]
pub struct PlaybackSchedule {
    next_start_time: f64,
}

impl PlaybackSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Reserve `duration` seconds of output starting no earlier than `now`.
    /// Returns the start time the buffer must be scheduled at.
    pub fn place(&mut self, now: f64, duration: f64) -> f64 {
        let start = self.next_start_time.max(now);
        self.next_start_time = start + duration.max(0.0);
        start
    }

    pub fn reset(&mut self) {
        self.next_start_time = 0.0;
    }
}
