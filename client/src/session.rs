//! One participant's connection to the other: a registered identity, one
//! message channel and one media call.
//!
//! The interviewer always dials; the candidate only answers. Nothing is
//! retried automatically. Every continuation checks the session is still
//! live before touching shared state.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::identity::PeerIdentity;
use crate::link::{Call, CallEvent, CallHandle, Channel, ChannelEvent, ChannelSender};
use crate::media::MediaStream;
use crate::signal::{IncomingLink, SignalClient, SignalError};
use crate::sync::Synchronizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ChannelOpen,
    ChannelClosed,
    RemoteStream(MediaStream),
    CallClosed,
    /// The other participant hasn't registered yet.
    PeerUnavailable(String),
    Error(String),
}

pub struct PeerSession {
    shared: Arc<SessionShared>,
}

struct SessionShared {
    local: PeerIdentity,
    remote: PeerIdentity,
    signal: SignalClient,
    sync: Arc<Mutex<Synchronizer>>,
    status: Mutex<ConnectionStatus>,
    live: AtomicBool,
    ended: AtomicBool,
    local_stream: Mutex<Option<MediaStream>>,
    channel: Mutex<Option<ChannelSender>>,
    call: Mutex<Option<CallHandle>>,
    remote_stream: Mutex<Option<MediaStream>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerSession {
    pub fn new(
        local: PeerIdentity,
        signal: SignalClient,
        sync: Arc<Mutex<Synchronizer>>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let remote = local.remote();
        let session = Self {
            shared: Arc::new(SessionShared {
                local,
                remote,
                signal,
                sync,
                status: Mutex::new(ConnectionStatus::Disconnected),
                live: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                local_stream: Mutex::new(None),
                channel: Mutex::new(None),
                call: Mutex::new(None),
                remote_stream: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                events,
            }),
        };
        (session, rx)
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.shared.local
    }

    pub fn remote(&self) -> &PeerIdentity {
        &self.shared.remote
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.lock()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.shared.remote_stream.lock().clone()
    }

    pub fn has_open_channel(&self) -> bool {
        self.shared
            .channel
            .lock()
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    pub fn has_open_call(&self) -> bool {
        self.shared
            .call
            .lock()
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    /// Register our identity, start answering, and dial if we lead.
    pub async fn start(&self, local_stream: MediaStream) -> Result<(), SignalError> {
        let shared = &self.shared;
        if shared.ended.load(Ordering::SeqCst) {
            return Err(SignalError::TransportClosed);
        }
        shared.set_status(ConnectionStatus::Connecting);
        *shared.local_stream.lock() = Some(local_stream);
        shared.live.store(true, Ordering::SeqCst);

        let address = shared.local.address();
        let incoming = match shared.signal.register(&address).await {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::error!("Failed to register {}: {}", address, e);
                shared.set_status(ConnectionStatus::Error);
                shared.emit(SessionEvent::Error(e.to_string()));
                return Err(e);
            }
        };
        if !shared.is_live() {
            shared.signal.unregister();
            return Ok(());
        }
        shared.set_status(ConnectionStatus::Connected);
        tracing::info!("Registered as {}", address);

        let handler = tokio::spawn(listen(Arc::clone(shared), incoming));
        shared.tasks.lock().push(handler);

        if shared.local.role().is_initiator() {
            shared.dial().await;
        } else {
            tracing::info!("Waiting for {} to connect", shared.remote.address());
        }
        Ok(())
    }

    /// Dial again whatever link is missing. Only the initiator dials.
    pub async fn redial(&self) -> bool {
        let shared = &self.shared;
        if !shared.local.role().is_initiator() || !shared.is_live() {
            return false;
        }
        if *shared.status.lock() != ConnectionStatus::Connected {
            return false;
        }
        shared.dial().await;
        true
    }

    /// Close call, close channel, release the identity. Safe to repeat.
    pub fn end(&self) {
        let shared = &self.shared;
        if shared.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.live.store(false, Ordering::SeqCst);

        let call = shared.call.lock().take();
        if let Some(call) = call {
            call.close();
        }
        let channel = shared.channel.lock().take();
        if let Some(channel) = channel {
            channel.close();
        }
        shared.signal.unregister();

        for task in shared.tasks.lock().drain(..) {
            task.abort();
        }
        shared.sync.lock().detach_channel();
        shared.remote_stream.lock().take();
        shared.local_stream.lock().take();
        shared.set_status(ConnectionStatus::Disconnected);
        tracing::info!("Peer session for {} ended", shared.local.address());
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.end();
    }
}

impl SessionShared {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn dial(self: &Arc<Self>) {
        let target = self.remote.address();
        let call_open = self.call.lock().as_ref().map(|c| c.is_open()).unwrap_or(false);
        if !call_open {
            let Some(local) = self.local_stream.lock().clone() else {
                return;
            };
            match self.signal.call(&target, local).await {
                Ok(call) => self.install_call(call),
                Err(SignalError::PeerUnavailable(who)) => {
                    tracing::warn!("{} is not here yet", who);
                    self.emit(SessionEvent::PeerUnavailable(who));
                    return;
                }
                Err(e) => {
                    tracing::warn!("Call to {} failed: {}", target, e);
                    self.emit(SessionEvent::Error(e.to_string()));
                }
            }
        }

        let channel_open = self
            .channel
            .lock()
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false);
        if !channel_open {
            match self.signal.connect(&target).await {
                Ok(channel) => self.install_channel(channel),
                Err(SignalError::PeerUnavailable(who)) => {
                    tracing::warn!("{} is not here yet", who);
                    self.emit(SessionEvent::PeerUnavailable(who));
                }
                Err(e) => {
                    tracing::warn!("Channel to {} failed: {}", target, e);
                    self.emit(SessionEvent::Error(e.to_string()));
                }
            }
        }
    }

    fn install_call(self: &Arc<Self>, mut call: Call) {
        if !self.is_live() {
            call.close();
            return;
        }
        let handle = call.handle();
        let previous = self.call.lock().replace(handle.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = call.next_event().await {
                if !shared.is_live() {
                    break;
                }
                match event {
                    CallEvent::Stream(remote) => {
                        tracing::info!("Receiving media from {}", call.remote());
                        *shared.remote_stream.lock() = Some(remote.clone());
                        shared.emit(SessionEvent::RemoteStream(remote));
                    }
                    CallEvent::Close => {
                        let mut current = shared.call.lock();
                        if current.as_ref().map(|c| c.id()) == Some(handle.id()) {
                            current.take();
                            shared.remote_stream.lock().take();
                        }
                        drop(current);
                        tracing::info!("Call with {} closed", call.remote());
                        shared.emit(SessionEvent::CallClosed);
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn install_channel(self: &Arc<Self>, mut channel: Channel) {
        if !self.is_live() {
            channel.close();
            return;
        }
        let sender = channel.sender();
        let previous = self.channel.lock().replace(sender.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        let bootstrap = self.local.role().is_initiator();
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = channel.next_event().await {
                if !shared.is_live() {
                    break;
                }
                match event {
                    ChannelEvent::Open => {
                        shared.sync.lock().attach_channel(sender.clone(), bootstrap);
                        shared.emit(SessionEvent::ChannelOpen);
                    }
                    ChannelEvent::Data(text) => shared.sync.lock().receive(&text),
                    ChannelEvent::Close => {
                        let mut current = shared.channel.lock();
                        if current.as_ref().map(|c| c.id()) == Some(sender.id()) {
                            current.take();
                            shared.sync.lock().detach_channel();
                        }
                        drop(current);
                        tracing::info!("Channel with {} closed", sender.remote());
                        shared.emit(SessionEvent::ChannelClosed);
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }
}

/// Answer every call with our stream; adopt every channel.
async fn listen(shared: Arc<SessionShared>, mut incoming: mpsc::UnboundedReceiver<IncomingLink>) {
    while let Some(link) = incoming.recv().await {
        if !shared.is_live() {
            break;
        }
        match link {
            IncomingLink::Call(ringing) => {
                let Some(local) = shared.local_stream.lock().clone() else {
                    ringing.reject();
                    continue;
                };
                tracing::info!("Answering call from {}", ringing.caller());
                shared.install_call(ringing.answer(local));
            }
            IncomingLink::Connection(channel) => {
                tracing::info!("Channel from {}", channel.remote());
                shared.install_channel(channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Language};
    use crate::hub::SignalHub;
    use crate::identity::Role;
    use crate::media::MediaPacket;
    use crate::sync::SharedState;
    use std::time::Duration;

    fn participant(
        hub: &SignalHub,
        room: &str,
        role: Role,
    ) -> (PeerSession, mpsc::UnboundedReceiver<SessionEvent>, Arc<Mutex<Synchronizer>>) {
        let (sync, _) = Synchronizer::new(Arc::new(Catalog::builtin()), role.label());
        let sync = Arc::new(Mutex::new(sync));
        let (session, events) = PeerSession::new(
            PeerIdentity::new(room, role),
            SignalClient::connect_hub(hub),
            Arc::clone(&sync),
        );
        (session, events, sync)
    }

    async fn next_matching(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        let wait = async {
            loop {
                match events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream ended"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for session event")
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

    #[tokio::test]
    async fn test_candidate_waits_then_interviewer_connects() {
        let hub = SignalHub::new();
        let (candidate, mut candidate_events, candidate_sync) =
            participant(&hub, "42-7", Role::Candidate);
        let (interviewer, mut interviewer_events, interviewer_sync) =
            participant(&hub, "42-7", Role::Interviewer);

        let candidate_media = MediaStream::new();
        candidate.start(candidate_media.clone()).await.unwrap();
        assert_eq!(candidate.status(), ConnectionStatus::Connected);
        assert!(!candidate.has_open_channel());

        {
            let mut sync = interviewer_sync.lock();
            sync.change_question("two-sum");
            sync.change_language(Language::Python);
            sync.edit_code("x");
        }
        interviewer.start(MediaStream::new()).await.unwrap();

        next_matching(&mut candidate_events, |e| matches!(e, SessionEvent::ChannelOpen)).await;
        next_matching(&mut interviewer_events, |e| matches!(e, SessionEvent::ChannelOpen)).await;
        let mut remote = interviewer.remote_stream();
        for _ in 0..50 {
            if remote.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote = interviewer.remote_stream();
        }
        let remote = remote.expect("interviewer receives the candidate's media");

        let expected = SharedState {
            code: "x".into(),
            language: Language::Python,
            active_question_id: Some("two-sum".into()),
        };
        for _ in 0..50 {
            if candidate_sync.lock().snapshot() == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(candidate_sync.lock().snapshot(), expected);

        let mut packets = remote.subscribe();
        candidate_media.publish(MediaPacket::Video(vec![3]));
        assert_eq!(packets.recv().await.unwrap(), MediaPacket::Video(vec![3]));

        interviewer.end();
        next_matching(&mut candidate_events, |e| matches!(e, SessionEvent::ChannelClosed)).await;
        assert_eq!(interviewer.status(), ConnectionStatus::Disconnected);
        assert!(!hub.is_registered("42-7-interviewer"));
        assert!(hub.is_registered("42-7-candidate"));
    }

    #[tokio::test]
    async fn test_interviewer_first_reports_peer_unavailable() {
        let hub = SignalHub::new();
        let (interviewer, mut events, _) = participant(&hub, "room", Role::Interviewer);
        interviewer.start(MediaStream::new()).await.unwrap();
        match next_matching(&mut events, |e| matches!(e, SessionEvent::PeerUnavailable(_))).await {
            SessionEvent::PeerUnavailable(who) => assert_eq!(who, "room-candidate"),
            _ => unreachable!(),
        }
        assert_eq!(interviewer.status(), ConnectionStatus::Connected);
        assert!(!interviewer.has_open_call());

        let (candidate, _candidate_events, _) = participant(&hub, "room", Role::Candidate);
        candidate.start(MediaStream::new()).await.unwrap();
        assert!(!candidate.redial().await);
        assert!(interviewer.redial().await);
        next_matching(&mut events, |e| matches!(e, SessionEvent::ChannelOpen)).await;
        assert!(interviewer.has_open_call());
        assert!(interviewer.has_open_channel());
    }

    #[tokio::test]
    async fn test_duplicate_identity_sets_error() {
        let hub = SignalHub::new();
        let (first, _e1, _) = participant(&hub, "dup", Role::Candidate);
        let (second, _e2, _) = participant(&hub, "dup", Role::Candidate);
        first.start(MediaStream::new()).await.unwrap();
        let err = second.start(MediaStream::new()).await.unwrap_err();
        assert_eq!(err, SignalError::AlreadyTaken("dup-candidate".into()));
        assert_eq!(second.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let hub = SignalHub::new();
        let (session, _events, _) = participant(&hub, "idem", Role::Candidate);
        session.start(MediaStream::new()).await.unwrap();
        session.end();
        session.end();
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        wait_until(|| !hub.is_registered("idem-candidate")).await;
        assert!(session.start(MediaStream::new()).await.is_err());
    }
}
