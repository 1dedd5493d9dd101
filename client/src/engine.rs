//! Seam between the audio pipeline and whatever AI streaming service backs it.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::pcm;
use crate::constants::{
    AUDIO_OUTPUT_SAMPLE_RATE, LIVE_MODEL, PCM_SAMPLE_RATE, SYSTEM_INSTRUCTION, VOICE_NAME,
};
use crate::media::AudioFrame;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to reach the AI engine: {0}")]
    Connect(String),
    #[error("AI session setup failed: {0}")]
    Setup(String),
    #[error("AI session is closed")]
    Closed,
    #[error("AI transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub model: String,
    pub system_instruction: String,
    pub voice_name: String,
    /// Rate of the PCM16 chunks the engine streams back.
    pub output_sample_rate: u32,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            model: LIVE_MODEL.to_string(),
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            voice_name: VOICE_NAME.to_string(),
            output_sample_rate: AUDIO_OUTPUT_SAMPLE_RATE,
        }
    }
}

/// One realtime media chunk, already base64 encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeInput {
    pub mime_type: String,
    pub data: String,
}

impl RealtimeInput {
    pub fn audio(frame: &AudioFrame) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={}", PCM_SAMPLE_RATE),
            data: STANDARD.encode(pcm::f32_to_pcm16le(&frame.samples)),
        }
    }

    pub fn jpeg(bytes: &[u8]) -> Self {
        Self {
            mime_type: "image/jpeg".to_string(),
            data: STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Raw PCM16LE bytes at the configured output rate.
    Audio(Vec<u8>),
    Closed(Option<String>),
    Error(String),
}

/// Realtime input waiting for the transport. Holds one block; anything
/// produced while it is full is dropped.
pub const INPUT_QUEUE_DEPTH: usize = 1;

pub fn input_channel() -> (mpsc::Sender<RealtimeInput>, mpsc::Receiver<RealtimeInput>) {
    mpsc::channel(INPUT_QUEUE_DEPTH)
}

/// An open streaming session. Dropping it stops the transport task.
pub struct LiveSession {
    input: mpsc::Sender<RealtimeInput>,
    events: mpsc::UnboundedReceiver<LiveEvent>,
    task: Option<JoinHandle<()>>,
}

impl LiveSession {
    pub fn new(
        input: mpsc::Sender<RealtimeInput>,
        events: mpsc::UnboundedReceiver<LiveEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            input,
            events,
            task,
        }
    }

    pub fn into_parts(
        mut self,
    ) -> (
        mpsc::Sender<RealtimeInput>,
        mpsc::UnboundedReceiver<LiveEvent>,
        Option<JoinHandle<()>>,
    ) {
        let task = self.task.take();
        let (idle_tx, _) = input_channel();
        let (_, idle_rx) = mpsc::unbounded_channel();
        let input = std::mem::replace(&mut self.input, idle_tx);
        let events = std::mem::replace(&mut self.events, idle_rx);
        (input, events, task)
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait LiveEngine: Send + Sync {
    /// Resolves only once the remote session reports itself open.
    async fn open_session(&self, config: &LiveConfig) -> Result<LiveSession, EngineError>;
}
