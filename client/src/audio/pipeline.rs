//! Realtime audio between the local participant and the AI engine.
//!
//! One [`AudioPipeline`] is one engine session. It is built by
//! [`AudioPipeline::connect`] and torn down as a unit by
//! [`AudioPipeline::disconnect`]; it is never reused afterwards.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::meter::AmplitudeMeter;
use super::output::AudioOutput;
use super::pcm;
use super::schedule::PlaybackSchedule;
use crate::constants::{ANALYSER_FFT_SIZE, METER_INTERVAL};
use crate::engine::{EngineError, LiveConfig, LiveEngine, LiveEvent, RealtimeInput};
use crate::media::{MediaPacket, MediaStream};

pub type AmplitudeCallback = Arc<dyn Fn(f32) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone)]
pub struct PipelineCallbacks {
    pub on_amplitude: AmplitudeCallback,
    pub on_close: CloseCallback,
    pub on_error: ErrorCallback,
}

impl Default for PipelineCallbacks {
    fn default() -> Self {
        Self {
            on_amplitude: Arc::new(|_: f32| {}),
            on_close: Arc::new(|| {}),
            on_error: Arc::new(|_: String| {}),
        }
    }
}

/// Cheap handle for pushing stills into the session from another task.
#[derive(Clone)]
pub struct FrameSink {
    connected: Arc<AtomicBool>,
    input: mpsc::Sender<RealtimeInput>,
}

impl FrameSink {
    pub fn is_open(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.input.is_closed()
    }

    /// False when the session is closed or a block is still in flight.
    pub fn send_jpeg(&self, jpeg: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }
        self.input.try_send(RealtimeInput::jpeg(jpeg)).is_ok()
    }
}

pub struct AudioPipeline {
    connected: Arc<AtomicBool>,
    input: mpsc::Sender<RealtimeInput>,
    output: Arc<dyn AudioOutput>,
    schedule: Arc<Mutex<PlaybackSchedule>>,
    engine_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    torn_down: bool,
}

impl AudioPipeline {
    /// Open an engine session and start the capture, playback and meter
    /// paths. Returns only once the session is open. On failure the output
    /// is closed and nothing keeps running.
    pub async fn connect(
        engine: &dyn LiveEngine,
        config: &LiveConfig,
        stream: &MediaStream,
        output: Arc<dyn AudioOutput>,
        callbacks: PipelineCallbacks,
    ) -> Result<Self, EngineError> {
        let session = match engine.open_session(config).await {
            Ok(session) => session,
            Err(e) => {
                output.close();
                return Err(e);
            }
        };
        let (input, events, engine_task) = session.into_parts();
        let connected = Arc::new(AtomicBool::new(true));
        let schedule = Arc::new(Mutex::new(PlaybackSchedule::new()));

        let tasks = vec![
            spawn_capture(stream, input.clone(), Arc::clone(&connected)),
            spawn_playback(
                events,
                Arc::clone(&output),
                Arc::clone(&schedule),
                config.output_sample_rate,
                Arc::clone(&connected),
                callbacks.clone(),
            ),
            spawn_meter(Arc::clone(&output), Arc::clone(&connected), callbacks.on_amplitude),
        ];
        tracing::info!("Audio pipeline connected");

        Ok(Self {
            connected,
            input,
            output,
            schedule,
            engine_task,
            tasks,
            torn_down: false,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn frame_sink(&self) -> FrameSink {
        FrameSink {
            connected: Arc::clone(&self.connected),
            input: self.input.clone(),
        }
    }

    pub fn send_video_frame(&self, jpeg: &[u8]) -> bool {
        self.frame_sink().send_jpeg(jpeg)
    }

    /// Output-clock time at which the next received chunk may start.
    pub fn next_start_time(&self) -> f64 {
        self.schedule.lock().next_start_time()
    }

    pub fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.output.stop_all();
        self.output.close();
        self.schedule.lock().reset();
        if let Some(task) = self.engine_task.take() {
            task.abort();
        }
        tracing::info!("Audio pipeline disconnected");
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn spawn_capture(
    stream: &MediaStream,
    input: mpsc::Sender<RealtimeInput>,
    connected: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let mut packets = stream.subscribe();
    tokio::spawn(async move {
        loop {
            match packets.recv().await {
                Ok(MediaPacket::Audio(frame)) => {
                    if !connected.load(Ordering::SeqCst) {
                        break;
                    }
                    match input.try_send(RealtimeInput::audio(&frame)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::debug!("Engine busy, dropping capture block {}", frame.seq);
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                Ok(MediaPacket::Video(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Capture path skipped {skipped} frames");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_playback(
    mut events: mpsc::UnboundedReceiver<LiveEvent>,
    output: Arc<dyn AudioOutput>,
    schedule: Arc<Mutex<PlaybackSchedule>>,
    sample_rate: u32,
    connected: Arc<AtomicBool>,
    callbacks: PipelineCallbacks,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !connected.load(Ordering::SeqCst) {
                break;
            }
            match event {
                LiveEvent::Audio(bytes) => match pcm::decode_chunk(&bytes, sample_rate) {
                    Ok(buffer) => {
                        let start = schedule.lock().place(output.now(), buffer.duration());
                        output.schedule(buffer, start);
                    }
                    Err(e) => tracing::debug!("Dropping audio chunk: {e}"),
                },
                LiveEvent::Error(message) => {
                    tracing::warn!("AI session error: {message}");
                    (callbacks.on_error)(message);
                }
                LiveEvent::Closed(reason) => {
                    tracing::info!("AI session closed: {}", reason.as_deref().unwrap_or("no reason"));
                    if connected.swap(false, Ordering::SeqCst) {
                        (callbacks.on_close)();
                    }
                    break;
                }
            }
        }
    })
}

fn spawn_meter(
    output: Arc<dyn AudioOutput>,
    connected: Arc<AtomicBool>,
    on_amplitude: AmplitudeCallback,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut meter = AmplitudeMeter::new(ANALYSER_FFT_SIZE);
        let mut ticker = tokio::time::interval(METER_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !connected.load(Ordering::SeqCst) {
                break;
            }
            let level = meter.level(&output.recent_samples(meter.size()));
            on_amplitude(level);
        }
    })
}
