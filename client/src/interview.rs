//! One participant's interview: the peer session, proctoring, and for the
//! candidate the AI monitor with its video sampler.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::{AudioOutput, AudioPipeline, PipelineCallbacks};
use crate::catalog::Language;
use crate::constants::{VIDEO_FRAME_INTERVAL, VIDEO_JPEG_QUALITY, VIDEO_MAX_WIDTH};
use crate::engine::{LiveConfig, LiveEngine};
use crate::identity::{PeerIdentity, Role};
use crate::media::MediaStream;
use crate::proctor::{ProctorMonitor, VisibilitySource};
use crate::session::{ConnectionStatus, PeerSession, SessionEvent};
use crate::signal::SignalClient;
use crate::sync::Synchronizer;
use crate::video::VideoSampler;

const DEFAULT_QUESTION_TITLE: &str = "Coding Problem";

/// Everything needed to open the AI monitor.
pub struct AiSetup {
    pub engine: Arc<dyn LiveEngine>,
    pub config: LiveConfig,
    pub output: Arc<dyn AudioOutput>,
    pub callbacks: PipelineCallbacks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiStatus {
    Disabled,
    Connecting,
    Active,
    /// Opening the engine session failed; the interview goes on without it.
    Failed,
    Stopped,
}

/// What the report generator needs once the interview is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterviewSummary {
    pub code: String,
    pub language: Language,
    pub question_title: String,
}

struct AiSlot {
    live: AtomicBool,
    pipeline: Mutex<Option<AudioPipeline>>,
    sampler: Mutex<Option<VideoSampler>>,
    status: watch::Sender<AiStatus>,
}

impl AiSlot {
    /// Stop the AI side for good. A connect that is still finishing sees
    /// `live` cleared under the pipeline lock and tears itself down.
    fn shutdown(&self) {
        self.live.store(false, Ordering::SeqCst);
        let pipeline = self.pipeline.lock().take();
        if let Some(mut pipeline) = pipeline {
            pipeline.disconnect();
        }
        let sampler = self.sampler.lock().take();
        if let Some(mut sampler) = sampler {
            sampler.stop();
        }
        self.status.send_modify(|status| {
            if *status != AiStatus::Disabled && *status != AiStatus::Failed {
                *status = AiStatus::Stopped;
            }
        });
    }
}

pub struct Interview {
    role: Role,
    session: PeerSession,
    sync: Arc<Mutex<Synchronizer>>,
    local_stream: MediaStream,
    ai: Arc<AiSlot>,
    ai_status: watch::Receiver<AiStatus>,
    ai_task: Option<JoinHandle<()>>,
    proctor: Option<ProctorMonitor>,
    started_at: Instant,
    ended: bool,
}

impl Interview {
    /// Bring the interview up. Returns once registration has settled; the
    /// AI monitor keeps connecting in the background.
    pub async fn start(
        identity: PeerIdentity,
        signal: SignalClient,
        sync: Arc<Mutex<Synchronizer>>,
        local_stream: MediaStream,
        visibility: &VisibilitySource,
        ai: Option<AiSetup>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let role = identity.role();
        let (status_tx, ai_status) = watch::channel(AiStatus::Disabled);
        let slot = Arc::new(AiSlot {
            live: AtomicBool::new(true),
            pipeline: Mutex::new(None),
            sampler: Mutex::new(None),
            status: status_tx,
        });

        let ai_task = match ai {
            Some(setup) if role == Role::Candidate => {
                slot.status.send_replace(AiStatus::Connecting);
                Some(tokio::spawn(connect_ai(
                    Arc::clone(&slot),
                    setup,
                    local_stream.clone(),
                )))
            }
            Some(_) => {
                tracing::debug!("AI monitor only runs on the candidate side");
                None
            }
            None => None,
        };

        let (session, events) = PeerSession::new(identity, signal, Arc::clone(&sync));
        if let Err(e) = session.start(local_stream.clone()).await {
            tracing::warn!("Interview continues without a peer: {}", e);
        }
        let proctor = ProctorMonitor::start(role, visibility, Arc::clone(&sync));

        tracing::info!("Interview started as {}", role);
        (
            Self {
                role,
                session,
                sync,
                local_stream,
                ai: slot,
                ai_status,
                ai_task,
                proctor,
                started_at: Instant::now(),
                ended: false,
            },
            events,
        )
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn sync(&self) -> &Arc<Mutex<Synchronizer>> {
        &self.sync
    }

    pub fn local_stream(&self) -> &MediaStream {
        &self.local_stream
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn ai_status(&self) -> AiStatus {
        *self.ai_status.borrow()
    }

    /// Wait for the AI monitor attempt to settle. True if it is running.
    pub async fn ai_ready(&self) -> bool {
        let mut status = self.ai_status.clone();
        let active = match status.wait_for(|s| *s != AiStatus::Connecting).await {
            Ok(settled) => *settled == AiStatus::Active,
            Err(_) => false,
        };
        active
    }

    pub async fn redial(&self) -> bool {
        self.session.redial().await
    }

    /// Tear everything down in order: AI pipeline, video timer, proctoring,
    /// local tracks, then the peer session. Repeat calls only summarize.
    pub fn end(&mut self) -> InterviewSummary {
        if !self.ended {
            self.ended = true;
            if let Some(task) = self.ai_task.take() {
                task.abort();
            }
            self.ai.shutdown();
            if let Some(mut proctor) = self.proctor.take() {
                proctor.stop();
            }
            self.local_stream.stop();
            self.session.end();
            tracing::info!("Interview ended after {:.0}s", self.elapsed().as_secs_f64());
        }
        self.summary()
    }

    pub fn summary(&self) -> InterviewSummary {
        let sync = self.sync.lock();
        let state = sync.snapshot();
        let question_title = state
            .active_question_id
            .as_deref()
            .and_then(|id| sync.catalog().find(id))
            .map(|q| q.title.clone())
            .unwrap_or_else(|| DEFAULT_QUESTION_TITLE.to_string());
        InterviewSummary {
            code: state.code,
            language: state.language,
            question_title,
        }
    }
}

impl Drop for Interview {
    fn drop(&mut self) {
        self.end();
    }
}

async fn connect_ai(slot: Arc<AiSlot>, setup: AiSetup, stream: MediaStream) {
    let mut callbacks = setup.callbacks;
    let user_close = Arc::clone(&callbacks.on_close);
    let closing = Arc::downgrade(&slot);
    callbacks.on_close = Arc::new(move || {
        if let Some(slot) = closing.upgrade() {
            slot.status.send_replace(AiStatus::Stopped);
        }
        user_close();
    });

    let result = AudioPipeline::connect(
        setup.engine.as_ref(),
        &setup.config,
        &stream,
        setup.output,
        callbacks,
    )
    .await;

    let mut pipeline = match result {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::warn!("AI monitor unavailable, continuing without it: {}", e);
            slot.status.send_replace(AiStatus::Failed);
            return;
        }
    };

    let mut installed = slot.pipeline.lock();
    if !slot.live.load(Ordering::SeqCst) {
        drop(installed);
        pipeline.disconnect();
        return;
    }
    match stream.video_source() {
        Some(source) => {
            let sampler = VideoSampler::start(
                source,
                pipeline.frame_sink(),
                VIDEO_FRAME_INTERVAL,
                VIDEO_MAX_WIDTH,
                VIDEO_JPEG_QUALITY,
            );
            *slot.sampler.lock() = Some(sampler);
        }
        None => tracing::debug!("No local video source; sending audio only"),
    }
    *installed = Some(pipeline);
    slot.status.send_replace(AiStatus::Active);
    drop(installed);
    tracing::info!("AI monitor active");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ClockOutput;
    use crate::catalog::Catalog;
    use crate::engine::{input_channel, EngineError, LiveSession, RealtimeInput};
    use crate::hub::SignalHub;
    use crate::media::{StillImage, VideoSource};
    use crate::sync::{SharedState, SyncNotice};
    use async_trait::async_trait;

    struct RefusingEngine;

    #[async_trait]
    impl LiveEngine for RefusingEngine {
        async fn open_session(&self, _config: &LiveConfig) -> Result<LiveSession, EngineError> {
            Err(EngineError::Connect("connection refused".into()))
        }
    }

    #[derive(Default)]
    struct OpenEngine {
        inputs: Mutex<Option<mpsc::Receiver<RealtimeInput>>>,
    }

    #[async_trait]
    impl LiveEngine for OpenEngine {
        async fn open_session(&self, _config: &LiveConfig) -> Result<LiveSession, EngineError> {
            let (input_tx, input_rx) = input_channel();
            let (_event_tx, event_rx) = mpsc::unbounded_channel();
            *self.inputs.lock() = Some(input_rx);
            Ok(LiveSession::new(input_tx, event_rx, None))
        }
    }

    struct GreyCamera;

    impl VideoSource for GreyCamera {
        fn snapshot(&self) -> Option<StillImage> {
            Some(StillImage {
                width: 8,
                height: 6,
                rgb: vec![100; 8 * 6 * 3],
            })
        }
    }

    fn ai(engine: Arc<dyn LiveEngine>) -> AiSetup {
        AiSetup {
            engine,
            config: LiveConfig::default(),
            output: Arc::new(ClockOutput::new(24_000)),
            callbacks: PipelineCallbacks::default(),
        }
    }

    fn synchronizer(name: &str) -> (Arc<Mutex<Synchronizer>>, mpsc::UnboundedReceiver<SyncNotice>) {
        let (sync, notices) = Synchronizer::new(Arc::new(Catalog::builtin()), name);
        (Arc::new(Mutex::new(sync)), notices)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    async fn join(
        hub: &SignalHub,
        room: &str,
        role: Role,
        sync: &Arc<Mutex<Synchronizer>>,
        setup: Option<AiSetup>,
    ) -> Interview {
        let (interview, _events) = Interview::start(
            PeerIdentity::new(room, role),
            SignalClient::connect_hub(hub),
            Arc::clone(sync),
            MediaStream::new(),
            &VisibilitySource::new(),
            setup,
        )
        .await;
        interview
    }

    #[tokio::test]
    async fn test_late_interviewer_bootstraps_candidate() {
        let hub = SignalHub::new();
        let (candidate_sync, _) = synchronizer("Ada");
        let (interviewer_sync, _) = synchronizer("Grace");

        let candidate = join(&hub, "42-7", Role::Candidate, &candidate_sync, None).await;
        assert_eq!(candidate.status(), ConnectionStatus::Connected);
        assert!(!candidate.session().has_open_channel());

        {
            let mut sync = interviewer_sync.lock();
            sync.change_language(Language::Python);
            sync.edit_code("x");
        }
        let _interviewer = join(&hub, "42-7", Role::Interviewer, &interviewer_sync, None).await;

        let expected = SharedState {
            code: "x".into(),
            language: Language::Python,
            active_question_id: Some("two-sum".into()),
        };
        wait_until(|| candidate_sync.lock().snapshot() == expected).await;
    }

    #[tokio::test]
    async fn test_code_changes_apply_in_send_order() {
        let hub = SignalHub::new();
        let (candidate_sync, _) = synchronizer("Ada");
        let (interviewer_sync, mut notices) = synchronizer("Grace");
        let _candidate = join(&hub, "ord", Role::Candidate, &candidate_sync, None).await;
        let _interviewer = join(&hub, "ord", Role::Interviewer, &interviewer_sync, None).await;
        wait_until(|| candidate_sync.lock().is_channel_open()).await;

        {
            let mut sync = candidate_sync.lock();
            sync.edit_code("a");
            sync.edit_code("ab");
        }
        wait_until(|| interviewer_sync.lock().snapshot().code == "ab").await;

        let mut codes = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            if let SyncNotice::State(state) = notice {
                codes.push(state.code);
            }
        }
        assert_eq!(codes, vec!["a".to_string(), "ab".to_string()]);
    }

    #[tokio::test]
    async fn test_ai_failure_keeps_peer_session() {
        let hub = SignalHub::new();
        let (sync, _) = synchronizer("Ada");
        let mut interview = join(
            &hub,
            "ai-down",
            Role::Candidate,
            &sync,
            Some(ai(Arc::new(RefusingEngine))),
        )
        .await;

        assert!(!interview.ai_ready().await);
        assert_eq!(interview.ai_status(), AiStatus::Failed);
        assert_eq!(interview.status(), ConnectionStatus::Connected);
        assert!(interview.ai.pipeline.lock().is_none());

        let summary = interview.end();
        assert_eq!(interview.ai_status(), AiStatus::Failed);
        assert_eq!(summary.question_title, "Two Sum");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ai_monitor_samples_video() {
        let hub = SignalHub::new();
        let (sync, _) = synchronizer("Ada");
        let engine = Arc::new(OpenEngine::default());
        let (mut interview, _events) = Interview::start(
            PeerIdentity::new("cam", Role::Candidate),
            SignalClient::connect_hub(&hub),
            Arc::clone(&sync),
            MediaStream::with_video(Arc::new(GreyCamera)),
            &VisibilitySource::new(),
            Some(ai(engine.clone())),
        )
        .await;
        assert!(interview.ai_ready().await);

        tokio::time::sleep(VIDEO_FRAME_INTERVAL + Duration::from_millis(10)).await;
        let mut inputs = engine.inputs.lock().take().unwrap();
        let frame = inputs.try_recv().unwrap();
        assert_eq!(frame.mime_type, "image/jpeg");

        interview.end();
        assert_eq!(interview.ai_status(), AiStatus::Stopped);
        assert!(interview.ai.sampler.lock().is_none());
        assert!(!interview.local_stream().is_live());
    }

    #[tokio::test]
    async fn test_interviewer_never_runs_ai() {
        let hub = SignalHub::new();
        let (sync, _) = synchronizer("Grace");
        let interview = join(
            &hub,
            "no-ai",
            Role::Interviewer,
            &sync,
            Some(ai(Arc::new(OpenEngine::default()))),
        )
        .await;
        assert_eq!(interview.ai_status(), AiStatus::Disabled);
        assert!(!interview.ai_ready().await);
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let hub = SignalHub::new();
        let (sync, _) = synchronizer("Ada");
        let mut interview = join(&hub, "bye", Role::Candidate, &sync, None).await;
        sync.lock().change_question("palindrome");
        sync.lock().edit_code("return true");

        let first = interview.end();
        let second = interview.end();
        assert_eq!(first, second);
        assert_eq!(
            first,
            InterviewSummary {
                code: "return true".into(),
                language: Language::Javascript,
                question_title: "Valid Palindrome".into(),
            }
        );
        assert_eq!(interview.status(), ConnectionStatus::Disconnected);
        wait_until(|| !hub.is_registered("bye-candidate")).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_during_ai_connect_leaves_nothing_running() {
        let engine = Arc::new(OpenEngine::default());
        let (status_tx, status) = watch::channel(AiStatus::Connecting);
        let slot = Arc::new(AiSlot {
            live: AtomicBool::new(true),
            pipeline: Mutex::new(None),
            sampler: Mutex::new(None),
            status: status_tx,
        });

        // Park the connect task between its live check and installing the
        // pipeline, then shut down from another thread.
        let sampler_guard = slot.sampler.lock();
        let task = tokio::spawn(connect_ai(
            Arc::clone(&slot),
            ai(engine.clone()),
            MediaStream::with_video(Arc::new(GreyCamera)),
        ));
        wait_until(|| slot.pipeline.try_lock().is_none()).await;
        let shutdown = {
            let slot = Arc::clone(&slot);
            tokio::task::spawn_blocking(move || slot.shutdown())
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(sampler_guard);

        task.await.unwrap();
        shutdown.await.unwrap();
        assert!(slot.pipeline.lock().is_none());
        assert!(slot.sampler.lock().is_none());
        assert_eq!(*status.borrow(), AiStatus::Stopped);
        assert!(!slot.live.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connect_after_shutdown_disconnects() {
        let engine = Arc::new(OpenEngine::default());
        let (status_tx, status) = watch::channel(AiStatus::Connecting);
        let slot = Arc::new(AiSlot {
            live: AtomicBool::new(true),
            pipeline: Mutex::new(None),
            sampler: Mutex::new(None),
            status: status_tx,
        });
        slot.shutdown();

        connect_ai(Arc::clone(&slot), ai(engine.clone()), MediaStream::new()).await;
        assert!(slot.pipeline.lock().is_none());
        assert_eq!(*status.borrow(), AiStatus::Stopped);
        let mut inputs = engine.inputs.lock().take().unwrap();
        assert!(inputs.recv().await.is_none());
    }
}
