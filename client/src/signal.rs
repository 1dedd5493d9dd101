//! Client side of the signaling substrate: identity registration plus the
//! channel and call links routed through the relay.

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::hub::SignalHub;
use crate::link::{Call, CallMedia, Channel, ChannelEvent, IncomingCall, LinkHandle};
use crate::media::MediaStream;
use crate::protocol::{LinkKind, SignalMessage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("identity '{0}' is already registered")]
    AlreadyTaken(String),
    #[error("peer '{0}' is not available")]
    PeerUnavailable(String),
    #[error("not registered with the signaling service")]
    NotRegistered,
    #[error("link is closed")]
    LinkClosed,
    #[error("signaling transport closed")]
    TransportClosed,
    #[error("signaling protocol error: {0}")]
    Protocol(String),
}

/// A link someone else opened to our identity.
pub enum IncomingLink {
    Call(IncomingCall),
    Connection(Channel),
}

#[derive(Clone)]
pub struct SignalClient {
    inner: Arc<SignalClientState>,
}

struct SignalClientState {
    tx: Mutex<Option<mpsc::UnboundedSender<SignalMessage>>>,
    identity: Mutex<Option<String>>,
    pending_register: Mutex<Option<oneshot::Sender<Result<String, SignalError>>>>,
    pending_opens: DashMap<Uuid, oneshot::Sender<Result<(), SignalError>>>,
    routes: DashMap<Uuid, Arc<LinkRoute>>,
    incoming: Mutex<Option<mpsc::UnboundedSender<IncomingLink>>>,
    closed: AtomicBool,
    shutdown: Notify,
    stats: Mutex<SignalStats>,
}

enum LinkRoute {
    Channel {
        link: LinkHandle,
        events: mpsc::UnboundedSender<ChannelEvent>,
    },
    Call {
        link: LinkHandle,
        media: Arc<CallMedia>,
        /// Our side's media, present for calls we placed.
        local: Option<MediaStream>,
    },
}

impl LinkRoute {
    fn link(&self) -> &LinkHandle {
        match self {
            LinkRoute::Channel { link, .. } | LinkRoute::Call { link, .. } => link,
        }
    }
}

#[derive(Default, Clone)]
struct SignalStats {
    bytes_out: u64,
    bytes_in: u64,
    messages_out: u64,
    messages_in: u64,
    last_message_at: Option<Instant>,
    connected_since: Option<Instant>,
    endpoint_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignalStatsSnapshot {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub messages_out: u64,
    pub messages_in: u64,
    pub last_message_age: Option<f32>,
    pub connected_duration: Option<f32>,
    pub endpoint_label: Option<String>,
}

impl SignalClient {
    fn empty(label: &str) -> (Self, mpsc::UnboundedReceiver<SignalMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            inner: Arc::new(SignalClientState {
                tx: Mutex::new(Some(tx)),
                identity: Mutex::new(None),
                pending_register: Mutex::new(None),
                pending_opens: DashMap::new(),
                routes: DashMap::new(),
                incoming: Mutex::new(None),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
                stats: Mutex::new(SignalStats {
                    connected_since: Some(Instant::now()),
                    endpoint_label: Some(label.to_string()),
                    ..SignalStats::default()
                }),
            }),
        };
        (client, rx)
    }

    /// Connect to a relay over WebSocket. The returned receiver resolves
    /// when the socket closes.
    pub async fn connect_ws(server_url: &str) -> Result<(Self, oneshot::Receiver<()>)> {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .context("Failed to connect to signaling server")?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (client, mut rx) = Self::empty(server_url);

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&client.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = send_inner.shutdown.notified() => break,
                };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to serialize signal message: {e}");
                        continue;
                    }
                };
                send_inner.record_outgoing(json.len() as u64);
                if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
            send_inner.transport_closed();
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        let recv_inner = Arc::clone(&client.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        recv_inner.record_incoming(text.len() as u64);
                        match serde_json::from_str::<SignalMessage>(&text) {
                            Ok(parsed) => recv_inner.dispatch(parsed),
                            Err(e) => tracing::warn!("Unparseable signal message: {e}"),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
            recv_inner.transport_closed();
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        Ok((client, disconnect_rx))
    }

    /// Attach to an in-process hub. Same protocol, no socket.
    pub fn connect_hub(hub: &SignalHub) -> Self {
        let (client, mut rx) = Self::empty("loopback");
        let (hub_tx, mut hub_rx) = mpsc::unbounded_channel();
        let client_id = hub.attach(hub_tx);

        let send_inner = Arc::clone(&client.inner);
        let send_hub = hub.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            send_inner.record_outgoing(0);
                            send_hub.handle(client_id, msg);
                        }
                        None => break,
                    },
                    _ = send_inner.shutdown.notified() => break,
                }
            }
            send_hub.detach(client_id);
        });

        let recv_inner = Arc::downgrade(&client.inner);
        tokio::spawn(async move {
            while let Some(msg) = hub_rx.recv().await {
                let Some(inner) = recv_inner.upgrade() else {
                    break;
                };
                inner.record_incoming(0);
                inner.dispatch(msg);
            }
            if let Some(inner) = recv_inner.upgrade() {
                inner.transport_closed();
            }
        });

        client
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> Option<String> {
        self.inner.identity.lock().clone()
    }

    /// Claim `identity`. Incoming calls and channels arrive on the returned
    /// receiver for as long as the registration lasts.
    pub async fn register(
        &self,
        identity: &str,
    ) -> Result<mpsc::UnboundedReceiver<IncomingLink>, SignalError> {
        if let Some(current) = self.identity() {
            return Err(SignalError::Protocol(format!("already registered as {current}")));
        }
        let (done_tx, done_rx) = oneshot::channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        *self.inner.pending_register.lock() = Some(done_tx);
        *self.inner.incoming.lock() = Some(incoming_tx);

        let outcome = match self.inner.send(SignalMessage::Register {
            identity: identity.to_string(),
        }) {
            Ok(()) => done_rx.await.unwrap_or(Err(SignalError::TransportClosed)),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(identity) => {
                tracing::info!("Registered as {}", identity);
                *self.inner.identity.lock() = Some(identity);
                Ok(incoming_rx)
            }
            Err(e) => {
                self.inner.pending_register.lock().take();
                self.inner.incoming.lock().take();
                Err(e)
            }
        }
    }

    /// Open a message channel. Resolves once the relay reports it open.
    pub async fn connect(&self, remote: &str) -> Result<Channel, SignalError> {
        let link = self.inner.new_link(Uuid::new_v4(), LinkKind::Channel, remote)?;
        let (channel, events) = Channel::new(link.clone());
        self.inner
            .open_link(LinkRoute::Channel { link, events }, remote)
            .await?;
        Ok(channel)
    }

    /// Place a media call carrying `local`. Resolves once the relay has the
    /// link; the remote stream arrives as an event after the callee answers.
    pub async fn call(&self, remote: &str, local: MediaStream) -> Result<Call, SignalError> {
        let link = self.inner.new_link(Uuid::new_v4(), LinkKind::Call, remote)?;
        let (call, media) = Call::new(link.clone());
        self.inner
            .open_link(
                LinkRoute::Call {
                    link,
                    media,
                    local: Some(local),
                },
                remote,
            )
            .await?;
        Ok(call)
    }

    /// Release the identity. Every link closes; the other ends are told by
    /// the relay.
    pub fn unregister(&self) {
        if self.inner.identity.lock().take().is_none() {
            return;
        }
        let _ = self.inner.send(SignalMessage::Unregister);
        self.inner.incoming.lock().take();
        self.inner.close_all_routes();
        tracing::info!("Unregistered from signaling");
    }

    /// Drop the transport entirely. Open links close with it.
    pub fn shutdown(&self) {
        self.inner.tx.lock().take();
        self.inner.shutdown.notify_one();
    }

    pub fn stats_snapshot(&self) -> SignalStatsSnapshot {
        self.inner.snapshot()
    }
}

impl SignalClientState {
    fn send(&self, msg: SignalMessage) -> Result<(), SignalError> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| SignalError::TransportClosed),
            None => Err(SignalError::TransportClosed),
        }
    }

    fn new_link(
        self: &Arc<Self>,
        link_id: Uuid,
        kind: LinkKind,
        remote: &str,
    ) -> Result<LinkHandle, SignalError> {
        let outbound = self.tx.lock().clone().ok_or(SignalError::TransportClosed)?;
        let link = LinkHandle::new(link_id, kind, remote.to_string(), outbound);
        let weak: Weak<SignalClientState> = Arc::downgrade(self);
        link.set_close_hook(move || {
            if let Some(state) = weak.upgrade() {
                state.routes.remove(&link_id);
            }
        });
        Ok(link)
    }

    async fn open_link(&self, route: LinkRoute, remote: &str) -> Result<(), SignalError> {
        if self.identity.lock().is_none() {
            return Err(SignalError::NotRegistered);
        }
        let link = route.link().clone();
        let link_id = link.id();
        let (done_tx, done_rx) = oneshot::channel();
        self.routes.insert(link_id, Arc::new(route));
        self.pending_opens.insert(link_id, done_tx);

        let sent = self.send(SignalMessage::Open {
            link_id,
            target: remote.to_string(),
            kind: link.kind(),
        });
        let outcome = match sent {
            Ok(()) => done_rx.await.unwrap_or(Err(SignalError::TransportClosed)),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            self.pending_opens.remove(&link_id);
            self.routes.remove(&link_id);
            link.mark_closed();
            return Err(e);
        }
        tracing::debug!("{:?} link {} to {} open", link.kind(), link_id, remote);
        Ok(())
    }

    fn route(&self, link_id: &Uuid) -> Option<Arc<LinkRoute>> {
        self.routes.get(link_id).map(|entry| Arc::clone(entry.value()))
    }

    fn dispatch(self: &Arc<Self>, msg: SignalMessage) {
        match msg {
            SignalMessage::Registered { identity } => {
                if let Some(done) = self.pending_register.lock().take() {
                    let _ = done.send(Ok(identity));
                }
            }
            SignalMessage::IdentityTaken { identity } => {
                if let Some(done) = self.pending_register.lock().take() {
                    let _ = done.send(Err(SignalError::AlreadyTaken(identity)));
                }
            }
            SignalMessage::Incoming {
                link_id,
                from,
                kind,
            } => self.accept_incoming(link_id, from, kind),
            SignalMessage::Opened { link_id } => {
                if let Some(route) = self.route(&link_id) {
                    route.link().mark_open();
                    if let LinkRoute::Channel { events, .. } = route.as_ref() {
                        let _ = events.send(ChannelEvent::Open);
                    }
                }
                if let Some((_, done)) = self.pending_opens.remove(&link_id) {
                    let _ = done.send(Ok(()));
                }
            }
            SignalMessage::Accepted { link_id } => {
                if let Some(route) = self.route(&link_id) {
                    if let LinkRoute::Call {
                        link,
                        media,
                        local: Some(local),
                    } = route.as_ref()
                    {
                        media.start(link, local.clone());
                    }
                }
            }
            SignalMessage::Data { link_id, data } => match self.route(&link_id).as_deref() {
                Some(LinkRoute::Channel { events, .. }) => {
                    let _ = events.send(ChannelEvent::Data(data));
                }
                Some(LinkRoute::Call { media, .. }) => media.deliver(&data),
                None => tracing::debug!("Data for unknown link {}", link_id),
            },
            SignalMessage::PeerUnavailable { link_id, target } => {
                self.routes.remove(&link_id);
                if let Some((_, done)) = self.pending_opens.remove(&link_id) {
                    let _ = done.send(Err(SignalError::PeerUnavailable(target)));
                }
            }
            SignalMessage::Closed { link_id } => {
                if let Some((_, route)) = self.routes.remove(&link_id) {
                    route.link().mark_closed();
                }
            }
            SignalMessage::Error { message } => {
                tracing::warn!("Signaling relay error: {}", message);
            }
            other => tracing::warn!("Unexpected message from relay: {:?}", other),
        }
    }

    fn accept_incoming(self: &Arc<Self>, link_id: Uuid, from: String, kind: LinkKind) {
        let Some(incoming) = self.incoming.lock().clone() else {
            let _ = self.send(SignalMessage::Close { link_id });
            return;
        };
        let Ok(link) = self.new_link(link_id, kind, &from) else {
            return;
        };
        // The relay routed the link before telling us about it.
        link.mark_open();
        tracing::info!("Incoming {:?} link {} from {}", kind, link_id, from);

        let delivered = match kind {
            LinkKind::Channel => {
                let (channel, events) = Channel::new(link.clone());
                self.routes
                    .insert(link_id, Arc::new(LinkRoute::Channel { link: link.clone(), events }));
                incoming.send(IncomingLink::Connection(channel)).is_ok()
            }
            LinkKind::Call => {
                let (call, media) = Call::new(link.clone());
                self.routes.insert(
                    link_id,
                    Arc::new(LinkRoute::Call {
                        link: link.clone(),
                        media,
                        local: None,
                    }),
                );
                incoming
                    .send(IncomingLink::Call(IncomingCall::new(call)))
                    .is_ok()
            }
        };
        if !delivered {
            self.routes.remove(&link_id);
            link.close();
        }
    }

    fn close_all_routes(&self) {
        let ids: Vec<Uuid> = self.routes.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, route)) = self.routes.remove(&id) {
                route.link().mark_closed();
            }
        }
    }

    fn transport_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tx.lock().take();
        if let Some(done) = self.pending_register.lock().take() {
            let _ = done.send(Err(SignalError::TransportClosed));
        }
        let pending: Vec<Uuid> = self.pending_opens.iter().map(|entry| *entry.key()).collect();
        for id in pending {
            if let Some((_, done)) = self.pending_opens.remove(&id) {
                let _ = done.send(Err(SignalError::TransportClosed));
            }
        }
        self.close_all_routes();
        self.incoming.lock().take();
        self.stats.lock().connected_since = None;
        tracing::info!("Signaling transport closed");
    }

    fn record_outgoing(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_out += bytes;
        stats.messages_out += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn record_incoming(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_in += bytes;
        stats.messages_in += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn snapshot(&self) -> SignalStatsSnapshot {
        let stats = self.stats.lock().clone();
        SignalStatsSnapshot {
            bytes_out: stats.bytes_out,
            bytes_in: stats.bytes_in,
            messages_out: stats.messages_out,
            messages_in: stats.messages_in,
            last_message_age: stats.last_message_at.map(|t| t.elapsed().as_secs_f32()),
            connected_duration: stats.connected_since.map(|t| t.elapsed().as_secs_f32()),
            endpoint_label: stats.endpoint_label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::CallEvent;
    use crate::media::MediaPacket;

    #[tokio::test]
    async fn test_register_conflict() {
        let hub = SignalHub::new();
        let a = SignalClient::connect_hub(&hub);
        let b = SignalClient::connect_hub(&hub);
        let _incoming = a.register("r-candidate").await.unwrap();
        assert_eq!(
            b.register("r-candidate").await.err(),
            Some(SignalError::AlreadyTaken("r-candidate".into()))
        );
        assert!(matches!(a.register("r-other").await, Err(SignalError::Protocol(_))));
        assert_eq!(a.identity().as_deref(), Some("r-candidate"));
        assert_eq!(b.identity(), None);
    }

    #[tokio::test]
    async fn test_connect_requires_registration_and_peer() {
        let hub = SignalHub::new();
        let a = SignalClient::connect_hub(&hub);
        assert_eq!(a.connect("r-candidate").await.err(), Some(SignalError::NotRegistered));
        let _incoming = a.register("r-interviewer").await.unwrap();
        assert_eq!(
            a.connect("r-candidate").await.err(),
            Some(SignalError::PeerUnavailable("r-candidate".into()))
        );
        assert_eq!(hub.link_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let hub = SignalHub::new();
        let interviewer = SignalClient::connect_hub(&hub);
        let candidate = SignalClient::connect_hub(&hub);
        let _ = interviewer.register("r-interviewer").await.unwrap();
        let mut incoming = candidate.register("r-candidate").await.unwrap();

        let mut outbound = interviewer.connect("r-candidate").await.unwrap();
        assert_eq!(outbound.next_event().await, Some(ChannelEvent::Open));
        let mut inbound = match incoming.recv().await {
            Some(IncomingLink::Connection(channel)) => channel,
            _ => panic!("expected a channel"),
        };
        assert_eq!(inbound.remote(), "r-interviewer");
        assert_eq!(inbound.next_event().await, Some(ChannelEvent::Open));

        outbound.sender().send("a").unwrap();
        outbound.sender().send("ab").unwrap();
        assert_eq!(inbound.next_event().await, Some(ChannelEvent::Data("a".into())));
        assert_eq!(inbound.next_event().await, Some(ChannelEvent::Data("ab".into())));
        inbound.sender().send("back").unwrap();
        assert_eq!(outbound.next_event().await, Some(ChannelEvent::Data("back".into())));

        outbound.close();
        assert_eq!(inbound.next_event().await, Some(ChannelEvent::Close));
        assert!(!inbound.is_open());
        assert!(interviewer.stats_snapshot().messages_out >= 4);
    }

    #[tokio::test]
    async fn test_call_streams_after_answer() {
        let hub = SignalHub::new();
        let interviewer = SignalClient::connect_hub(&hub);
        let candidate = SignalClient::connect_hub(&hub);
        let _ = interviewer.register("r-interviewer").await.unwrap();
        let mut incoming = candidate.register("r-candidate").await.unwrap();

        let interviewer_media = MediaStream::new();
        let candidate_media = MediaStream::new();
        let mut outgoing = interviewer
            .call("r-candidate", interviewer_media.clone())
            .await
            .unwrap();
        let ringing = match incoming.recv().await {
            Some(IncomingLink::Call(call)) => call,
            _ => panic!("expected a call"),
        };
        assert_eq!(ringing.caller(), "r-interviewer");
        let mut answered = ringing.answer(candidate_media.clone());

        let seen_by_candidate = match answered.next_event().await {
            Some(CallEvent::Stream(stream)) => stream,
            other => panic!("unexpected {other:?}"),
        };
        let seen_by_interviewer = match outgoing.next_event().await {
            Some(CallEvent::Stream(stream)) => stream,
            other => panic!("unexpected {other:?}"),
        };

        let mut rx = seen_by_interviewer.subscribe();
        candidate_media.publish(MediaPacket::Video(vec![4, 2]));
        assert_eq!(rx.recv().await.unwrap(), MediaPacket::Video(vec![4, 2]));

        let mut rx = seen_by_candidate.subscribe();
        interviewer_media.publish(MediaPacket::Video(vec![1]));
        assert_eq!(rx.recv().await.unwrap(), MediaPacket::Video(vec![1]));

        candidate.unregister();
        assert!(matches!(outgoing.next_event().await, Some(CallEvent::Close)));
        assert!(!hub.is_registered("r-candidate"));
        assert_eq!(interviewer.inner.routes.len(), 0);
    }

    #[tokio::test]
    async fn test_answerer_close_drops_route() {
        let hub = SignalHub::new();
        let interviewer = SignalClient::connect_hub(&hub);
        let candidate = SignalClient::connect_hub(&hub);
        let _ = interviewer.register("r-interviewer").await.unwrap();
        let mut incoming = candidate.register("r-candidate").await.unwrap();

        for _ in 0..3 {
            let _outgoing = interviewer.call("r-candidate", MediaStream::new()).await.unwrap();
            let mut channel = interviewer.connect("r-candidate").await.unwrap();
            assert_eq!(channel.next_event().await, Some(ChannelEvent::Open));
            for _ in 0..2 {
                match incoming.recv().await {
                    Some(IncomingLink::Call(call)) => call.answer(MediaStream::new()).close(),
                    Some(IncomingLink::Connection(channel)) => channel.close(),
                    None => panic!("incoming stream ended"),
                }
            }
            assert_eq!(channel.next_event().await, Some(ChannelEvent::Close));
        }
        assert_eq!(candidate.inner.routes.len(), 0);
        assert_eq!(hub.link_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_identity() {
        let hub = SignalHub::new();
        let a = SignalClient::connect_hub(&hub);
        let _incoming = a.register("r-candidate").await.unwrap();
        a.shutdown();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!hub.is_registered("r-candidate"));
        assert_eq!(hub.identity_count(), 0);
    }
}
