use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::audio::FrameSink;
use crate::media::{StillImage, VideoSource};

/// Sends one still from a fixed video source per tick. Frames between ticks
/// are never sent; a tick with no frame available is skipped.
pub struct VideoSampler {
    task: Option<JoinHandle<()>>,
}

impl VideoSampler {
    pub fn start(
        source: Arc<dyn VideoSource>,
        sink: FrameSink,
        period: Duration,
        max_width: u32,
        quality: u8,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !sink.is_open() {
                    break;
                }
                let Some(still) = source.snapshot() else {
                    continue;
                };
                match encode_jpeg(&still, max_width, quality) {
                    Ok(jpeg) => {
                        sink.send_jpeg(&jpeg);
                    }
                    Err(e) => tracing::debug!("Skipping video frame: {e:#}"),
                }
            }
        });
        Self { task: Some(task) }
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Video sampler stopped");
        }
    }
}

impl Drop for VideoSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Downscale to at most `max_width` (keeping aspect) and JPEG-encode.
pub fn encode_jpeg(still: &StillImage, max_width: u32, quality: u8) -> Result<Vec<u8>> {
    let image = RgbImage::from_raw(still.width, still.height, still.rgb.clone())
        .ok_or_else(|| anyhow!("still buffer does not match {}x{}", still.width, still.height))?;
    let image = if still.width > max_width && max_width > 0 {
        let height = ((still.height as u64 * max_width as u64) / still.width as u64).max(1) as u32;
        imageops::resize(&image, max_width, height, FilterType::Triangle)
    } else {
        image
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode_image(&image)
        .context("Failed to encode JPEG")?;
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn still(width: u32, height: u32) -> StillImage {
        StillImage {
            width,
            height,
            rgb: vec![128; (width * height * 3) as usize],
        }
    }

    #[test]
    fn test_encode_downscales() {
        let jpeg = encode_jpeg(&still(1280, 720), 640, 50).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        let decoded = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.width(), 640);
        assert_eq!(decoded.height(), 360);

        let small = encode_jpeg(&still(320, 240), 640, 50).unwrap();
        let decoded = image::load_from_memory_with_format(&small, image::ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.width(), 320);
    }

    #[test]
    fn test_encode_rejects_short_buffer() {
        let bad = StillImage {
            width: 10,
            height: 10,
            rgb: vec![0; 10],
        };
        assert!(encode_jpeg(&bad, 640, 50).is_err());
    }
}
