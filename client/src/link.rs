//! Channel and call handles over a signaling link.
//!
//! Both ride on the same relay link primitive but are distinct types with
//! their own event sets. A link closes once; whichever side closes first,
//! the local close hook fires exactly one time.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::media::{MediaPacket, MediaStream};
use crate::protocol::{LinkKind, SignalMessage};
use crate::signal::SignalError;

type CloseHook = Box<dyn FnOnce() + Send>;

struct LinkShared {
    id: Uuid,
    kind: LinkKind,
    remote: String,
    open: AtomicBool,
    closed: AtomicBool,
    outbound: mpsc::UnboundedSender<SignalMessage>,
    on_close: Mutex<Option<CloseHook>>,
}

#[derive(Clone)]
pub(crate) struct LinkHandle {
    inner: Arc<LinkShared>,
}

impl LinkHandle {
    pub(crate) fn new(
        id: Uuid,
        kind: LinkKind,
        remote: String,
        outbound: mpsc::UnboundedSender<SignalMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(LinkShared {
                id,
                kind,
                remote,
                open: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                outbound,
                on_close: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.inner.id
    }

    pub(crate) fn kind(&self) -> LinkKind {
        self.inner.kind
    }

    pub(crate) fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst) && !self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_close_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.inner.on_close.lock() = Some(Box::new(hook));
    }

    pub(crate) fn mark_open(&self) {
        if !self.inner.closed.load(Ordering::SeqCst) {
            self.inner.open.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn send(&self, data: String) -> Result<(), SignalError> {
        if !self.is_open() {
            return Err(SignalError::LinkClosed);
        }
        self.inner
            .outbound
            .send(SignalMessage::Data {
                link_id: self.inner.id,
                data,
            })
            .map_err(|_| SignalError::TransportClosed)
    }

    /// Close from this side and tell the relay.
    pub(crate) fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inner.outbound.send(SignalMessage::Close {
                link_id: self.inner.id,
            });
            self.finish();
        }
    }

    /// The relay already knows; just run the local side of the close.
    pub(crate) fn mark_closed(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.finish();
        }
    }

    fn finish(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        let hook = self.inner.on_close.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Data(String),
    Close,
}

/// Sending half of a message channel.
#[derive(Clone)]
pub struct ChannelSender {
    link: LinkHandle,
}

impl ChannelSender {
    pub fn id(&self) -> Uuid {
        self.link.id()
    }

    pub fn remote(&self) -> &str {
        self.link.remote()
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn send(&self, text: impl Into<String>) -> Result<(), SignalError> {
        self.link.send(text.into())
    }

    pub fn close(&self) {
        self.link.close();
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("id", &self.link.id())
            .field("remote", &self.link.remote())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Ordered, reliable text channel to one remote identity.
pub struct Channel {
    sender: ChannelSender,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    /// Wire a fresh channel; returns the event sender the router feeds.
    pub(crate) fn new(link: LinkHandle) -> (Self, mpsc::UnboundedSender<ChannelEvent>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let close_tx = events_tx.clone();
        let previous = link.inner.on_close.lock().take();
        link.set_close_hook(move || {
            if let Some(previous) = previous {
                previous();
            }
            let _ = close_tx.send(ChannelEvent::Close);
        });
        (
            Self {
                sender: ChannelSender { link },
                events,
            },
            events_tx,
        )
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn remote(&self) -> &str {
        self.sender.remote()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The remote participant's media, available once both ends stream.
    Stream(MediaStream),
    Close,
}

pub(crate) struct CallMedia {
    remote: MediaStream,
    streaming: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<CallEvent>,
}

impl CallMedia {
    /// Begin forwarding `local` to the other end and publish the remote
    /// stream. Runs once per call.
    pub(crate) fn start(&self, link: &LinkHandle, local: MediaStream) {
        if self.streaming.swap(true, Ordering::SeqCst) || !link.is_open() {
            return;
        }
        *self.pump.lock() = Some(spawn_media_pump(link.clone(), local));
        let _ = self.events.send(CallEvent::Stream(self.remote.clone()));
    }

    /// One inbound wire packet from the other end.
    pub(crate) fn deliver(&self, data: &str) {
        match MediaPacket::from_wire(data) {
            Ok(packet) => self.remote.publish(packet),
            Err(e) => tracing::debug!("Dropping media packet: {e:#}"),
        }
    }

    fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.remote.stop();
        let _ = self.events.send(CallEvent::Close);
    }
}

fn spawn_media_pump(link: LinkHandle, local: MediaStream) -> JoinHandle<()> {
    let mut packets = local.subscribe();
    tokio::spawn(async move {
        loop {
            match packets.recv().await {
                Ok(packet) => {
                    if !link.is_open() {
                        break;
                    }
                    match packet.to_wire() {
                        Ok(text) => {
                            if link.send(text).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::debug!("Skipping media packet: {e:#}"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Call {} skipped {} local packets", link.id(), skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[derive(Clone)]
pub struct CallHandle {
    link: LinkHandle,
    media: Arc<CallMedia>,
}

impl CallHandle {
    pub fn id(&self) -> Uuid {
        self.link.id()
    }

    pub fn remote(&self) -> &str {
        self.link.remote()
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn close(&self) {
        self.link.close();
    }
}

/// Media link to one remote identity.
pub struct Call {
    handle: CallHandle,
    events: mpsc::UnboundedReceiver<CallEvent>,
}

impl Call {
    pub(crate) fn new(link: LinkHandle) -> (Self, Arc<CallMedia>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let media = Arc::new(CallMedia {
            remote: MediaStream::new(),
            streaming: AtomicBool::new(false),
            pump: Mutex::new(None),
            events: events_tx,
        });
        let previous = link.inner.on_close.lock().take();
        let closing = Arc::clone(&media);
        link.set_close_hook(move || {
            if let Some(previous) = previous {
                previous();
            }
            closing.shutdown();
        });
        (
            Self {
                handle: CallHandle {
                    link,
                    media: Arc::clone(&media),
                },
                events,
            },
            media,
        )
    }

    pub fn handle(&self) -> CallHandle {
        self.handle.clone()
    }

    pub fn remote(&self) -> &str {
        self.handle.remote()
    }

    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

/// A call someone else placed. Nothing flows until it is answered.
pub struct IncomingCall {
    call: Call,
}

impl IncomingCall {
    pub(crate) fn new(call: Call) -> Self {
        Self { call }
    }

    pub fn caller(&self) -> &str {
        self.call.remote()
    }

    /// Accept with our local media and start streaming both ways.
    pub fn answer(self, local: MediaStream) -> Call {
        let handle = &self.call.handle;
        let _ = handle.link.inner.outbound.send(SignalMessage::Accept {
            link_id: handle.link.id(),
        });
        handle.media.start(&handle.link, local);
        self.call
    }

    pub fn reject(self) {
        self.call.close();
    }
}
