use crate::media::AudioFrame;

/// Cuts a continuous mono feed into fixed-size frames.
///
/// The sequence number counts frames, so a consumer can tell how many
/// capture slots went by even if packets were skipped on the way.
pub struct Framer {
    // queued samples for the frame being built
    pending: Vec<f32>,
    // samples per emitted frame
    frame_size: usize,
    sample_rate: u32,
    seq: u64,
}

impl Framer {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            pending: Vec::with_capacity(frame_size),
            frame_size,
            sample_rate,
            seq: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Push samples; every completed frame is handed to `emit` in order.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        let mut rest = samples;
        while !rest.is_empty() {
            let room = self.frame_size - self.pending.len();
            let take = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_size {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                emit(AudioFrame {
                    seq: self.seq,
                    sample_rate: self.sample_rate,
                    samples,
                });
                self.seq += 1;
            }
        }
    }
}

/// Average interleaved channels down to mono.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
        .collect()
}
