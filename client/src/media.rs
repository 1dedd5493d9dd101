//! Local and remote media streams.
//!
//! A [`MediaStream`] is a fan-out of [`MediaPacket`]s. The capture side
//! publishes into the local stream; the AI pipeline and the peer call each
//! subscribe independently. A call exposes the other participant's packets
//! as a fresh stream on this side.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::audio::pcm;

const STREAM_CAPACITY: usize = 64;

/// A fixed-length block of mono PCM samples with its capture slot.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub seq: u64,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }
}

/// Raw RGB still grabbed from a camera.
#[derive(Debug, Clone)]
pub struct StillImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// A specific local video source. Held by the stream that carries it so the
/// sampler never has to go looking for one.
pub trait VideoSource: Send + Sync {
    fn snapshot(&self) -> Option<StillImage>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaPacket {
    Audio(AudioFrame),
    /// JPEG-encoded still.
    Video(Vec<u8>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum WirePacket {
    Audio { seq: u64, rate: u32, data: String },
    Video { data: String },
}

impl MediaPacket {
    /// Text form used when a packet crosses a call link.
    pub fn to_wire(&self) -> Result<String> {
        let wire = match self {
            MediaPacket::Audio(frame) => WirePacket::Audio {
                seq: frame.seq,
                rate: frame.sample_rate,
                data: STANDARD.encode(pcm::f32_to_pcm16le(&frame.samples)),
            },
            MediaPacket::Video(jpeg) => WirePacket::Video {
                data: STANDARD.encode(jpeg),
            },
        };
        serde_json::to_string(&wire).context("Failed to serialize media packet")
    }

    pub fn from_wire(text: &str) -> Result<Self> {
        let wire: WirePacket = serde_json::from_str(text).context("Malformed media packet")?;
        match wire {
            WirePacket::Audio { seq, rate, data } => {
                let bytes = STANDARD.decode(data).context("Audio payload is not base64")?;
                let samples = pcm::pcm16le_to_f32(&bytes)?;
                if rate == 0 {
                    bail!("Audio packet with zero sample rate");
                }
                Ok(MediaPacket::Audio(AudioFrame {
                    seq,
                    sample_rate: rate,
                    samples,
                }))
            }
            WirePacket::Video { data } => Ok(MediaPacket::Video(
                STANDARD.decode(data).context("Video payload is not base64")?,
            )),
        }
    }
}

#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: Uuid,
    tx: Mutex<Option<broadcast::Sender<MediaPacket>>>,
    video: Option<Arc<dyn VideoSource>>,
    live: AtomicBool,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_video(source: Arc<dyn VideoSource>) -> Self {
        Self::build(Some(source))
    }

    fn build(video: Option<Arc<dyn VideoSource>>) -> Self {
        let (tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            inner: Arc::new(StreamInner {
                id: Uuid::new_v4(),
                tx: Mutex::new(Some(tx)),
                video,
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn video_source(&self) -> Option<Arc<dyn VideoSource>> {
        self.inner.video.clone()
    }

    /// Deliver a packet to every current subscriber. Packets published with
    /// nobody listening are dropped.
    pub fn publish(&self, packet: MediaPacket) {
        if let Some(tx) = self.inner.tx.lock().as_ref() {
            let _ = tx.send(packet);
        }
    }

    /// A subscriber sees only packets published after this call. Subscribing
    /// to a stopped stream yields a receiver that is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<MediaPacket> {
        match self.inner.tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Stop every track. Subscribers drain what is buffered and then close.
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            self.inner.tx.lock().take();
            tracing::debug!("Media stream {} stopped", self.inner.id);
        }
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("live", &self.is_live())
            .field("video", &self.inner.video.is_some())
            .finish()
    }
}
