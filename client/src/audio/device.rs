//! Sound card capture and playback via cpal.
//!
//! A `cpal::Stream` must stay on the thread that built it, so each device
//! stream lives on its own parked thread until it is closed.

use anyhow::{anyhow, bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;

use super::capture::{downmix, Framer};
use super::output::{AudioOutput, Timeline};
use super::pcm::{resample_linear, AudioBuffer};
use crate::constants::{CAPTURE_BLOCK_SAMPLES, PCM_SAMPLE_RATE};
use crate::media::{MediaPacket, MediaStream};

struct StreamThread {
    stop: Option<std_mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<T, F>(name: &str, build: F) -> Result<(Self, T)>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<(cpal::Stream, T)> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<T>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let started = build().and_then(|(stream, info)| {
                    stream.play().context("Failed to start audio stream")?;
                    Ok((stream, info))
                });
                let stream = match started {
                    Ok((stream, info)) => {
                        let _ = ready_tx.send(Ok(info));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            })
            .context("Failed to spawn audio thread")?;

        let info = ready_rx
            .recv()
            .map_err(|_| anyhow!("audio thread exited during setup"))??;
        Ok((
            Self {
                stop: Some(stop_tx),
                handle: Some(handle),
            },
            info,
        ))
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureSink {
    framer: Framer,
    stream: MediaStream,
    channels: usize,
    device_rate: u32,
}

impl CaptureSink {
    fn push(&mut self, data: &[f32]) {
        let mono = downmix(data, self.channels);
        let mono = resample_linear(&mono, self.device_rate, PCM_SAMPLE_RATE);
        let stream = &self.stream;
        self.framer
            .push(&mono, |frame| stream.publish(MediaPacket::Audio(frame)));
    }
}

/// Default microphone feeding 16 kHz mono frames into a media stream.
pub struct MicrophoneCapture {
    thread: StreamThread,
}

impl MicrophoneCapture {
    pub fn start(stream: MediaStream) -> Result<Self> {
        let (thread, ()) = StreamThread::spawn("techmeet-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| anyhow!("No default audio input device found"))?;
            let supported = device
                .default_input_config()
                .context("Failed to query input config")?;
            let config: cpal::StreamConfig = supported.config();
            tracing::info!(
                channels = config.channels,
                sample_rate = config.sample_rate.0,
                "Opening audio input device"
            );

            let mut sink = CaptureSink {
                framer: Framer::new(CAPTURE_BLOCK_SAMPLES, PCM_SAMPLE_RATE),
                stream,
                channels: config.channels as usize,
                device_rate: config.sample_rate.0,
            };
            let err_fn = |err: cpal::StreamError| tracing::warn!("Audio input stream error: {err}");
            let input = match supported.sample_format() {
                SampleFormat::F32 => device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| sink.push(data),
                    err_fn,
                )?,
                SampleFormat::I16 => device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let floats: Vec<f32> = data.iter().map(|s| *s as f32 / 32768.0).collect();
                        sink.push(&floats);
                    },
                    err_fn,
                )?,
                other => bail!("Unsupported input sample format {other:?}"),
            };
            Ok((input, ()))
        })?;
        Ok(Self { thread })
    }

    pub fn stop(mut self) {
        self.thread.stop();
    }
}

/// Default speaker with a sample-accurate clock. The clock advances as the
/// device pulls frames, so scheduled starts line up with what is heard.
pub struct SpeakerOutput {
    timeline: Arc<Mutex<Timeline>>,
    thread: Mutex<Option<StreamThread>>,
    closed: AtomicBool,
}

impl SpeakerOutput {
    pub fn open() -> Result<Self> {
        let (thread, timeline) = StreamThread::spawn("techmeet-playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| anyhow!("No default audio output device found"))?;
            let supported = device
                .default_output_config()
                .context("Failed to query output config")?;
            let config: cpal::StreamConfig = supported.config();
            tracing::info!(
                channels = config.channels,
                sample_rate = config.sample_rate.0,
                "Opening audio output device"
            );

            let timeline = Arc::new(Mutex::new(Timeline::new(
                config.sample_rate.0,
                config.sample_rate.0 as usize,
            )));

            let ch = (config.channels as usize).max(1);
            let render = Arc::clone(&timeline);
            let mut mono = Vec::new();
            let mut fill = move |len: usize| -> Vec<f32> {
                mono.resize(len / ch, 0.0);
                render.lock().render(&mut mono);
                mono.clone()
            };
            let err_fn = |err: cpal::StreamError| tracing::warn!("Audio output stream error: {err}");
            let output = match supported.sample_format() {
                SampleFormat::F32 => device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        data.fill(0.0);
                        let mono = fill(data.len());
                        for (chunk, sample) in data.chunks_exact_mut(ch).zip(mono) {
                            chunk.fill(sample);
                        }
                    },
                    err_fn,
                )?,
                SampleFormat::I16 => device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        data.fill(0);
                        let mono = fill(data.len());
                        for (chunk, sample) in data.chunks_exact_mut(ch).zip(mono) {
                            chunk.fill((sample * 32767.0) as i16);
                        }
                    },
                    err_fn,
                )?,
                other => bail!("Unsupported output sample format {other:?}"),
            };
            Ok((output, timeline))
        })?;
        Ok(Self {
            timeline,
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
        })
    }
}

impl AudioOutput for SpeakerOutput {
    fn sample_rate(&self) -> u32 {
        self.timeline.lock().rate()
    }

    fn now(&self) -> f64 {
        self.timeline.lock().now()
    }

    fn schedule(&self, buffer: AudioBuffer, start: f64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.timeline.lock().schedule(buffer, start);
    }

    fn recent_samples(&self, n: usize) -> Vec<f32> {
        let timeline = self.timeline.lock();
        timeline.window(timeline.frames_played(), n)
    }

    fn stop_all(&self) {
        self.timeline.lock().clear();
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_all();
        if let Some(mut thread) = self.thread.lock().take() {
            thread.stop();
        }
        tracing::debug!("Audio output closed");
    }
}
