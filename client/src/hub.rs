//! Identity registry and link router behind the signaling protocol.
//!
//! Transport-agnostic: every attached client is just an outbound queue. The
//! WebSocket relay and the in-process loopback both drive the same hub.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{LinkKind, SignalMessage};

const LOG_TAG: &str = "[Signal Hub]";

pub type ClientSender = mpsc::UnboundedSender<SignalMessage>;

#[derive(Clone, Default)]
pub struct SignalHub {
    /// All attached clients: client_id -> ClientEntry
    clients: Arc<DashMap<Uuid, ClientEntry>>,
    /// Registered identities: identity -> client_id
    identities: Arc<DashMap<String, Uuid>>,
    /// Open links: link_id -> LinkRoute
    links: Arc<DashMap<Uuid, LinkRoute>>,
}

struct ClientEntry {
    tx: ClientSender,
    identity: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct LinkRoute {
    kind: LinkKind,
    initiator: Uuid,
    target: Uuid,
}

impl LinkRoute {
    fn other_end(&self, client_id: Uuid) -> Option<Uuid> {
        if client_id == self.initiator {
            Some(self.target)
        } else if client_id == self.target {
            Some(self.initiator)
        } else {
            None
        }
    }
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, tx: ClientSender) -> Uuid {
        let client_id = Uuid::new_v4();
        self.clients.insert(
            client_id,
            ClientEntry {
                tx,
                identity: None,
            },
        );
        tracing::info!("{LOG_TAG} Client {} attached", client_id);
        client_id
    }

    pub fn detach(&self, client_id: Uuid) {
        self.unregister(client_id);
        self.clients.remove(&client_id);
        tracing::info!("{LOG_TAG} Client {} detached", client_id);
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.identities.contains_key(identity)
    }

    pub fn handle(&self, client_id: Uuid, msg: SignalMessage) {
        match msg {
            SignalMessage::Register { identity } => self.register(client_id, identity),
            SignalMessage::Open {
                link_id,
                target,
                kind,
            } => self.open(client_id, link_id, target, kind),
            SignalMessage::Accept { link_id } => self.accept(client_id, link_id),
            SignalMessage::Data { link_id, data } => self.relay(client_id, link_id, data),
            SignalMessage::Close { link_id } => self.close_link(client_id, link_id),
            SignalMessage::Unregister => self.unregister(client_id),
            other => {
                tracing::warn!("{LOG_TAG} Unexpected message from client {}: {:?}", client_id, other);
            }
        }
    }

    fn send_to(&self, client_id: Uuid, msg: SignalMessage) {
        if let Some(entry) = self.clients.get(&client_id) {
            let _ = entry.tx.send(msg);
        }
    }

    fn identity_of(&self, client_id: Uuid) -> Option<String> {
        self.clients
            .get(&client_id)
            .and_then(|entry| entry.identity.clone())
    }

    fn register(&self, client_id: Uuid, identity: String) {
        if let Some(existing) = self.identity_of(client_id) {
            self.send_to(
                client_id,
                SignalMessage::Error {
                    message: format!("already registered as {existing}"),
                },
            );
            return;
        }

        let claimed = match self.identities.entry(identity.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(client_id);
                true
            }
        };

        if !claimed {
            tracing::info!("{LOG_TAG} Identity {} already taken", identity);
            self.send_to(client_id, SignalMessage::IdentityTaken { identity });
            return;
        }

        if let Some(mut entry) = self.clients.get_mut(&client_id) {
            entry.identity = Some(identity.clone());
        }
        tracing::info!("{LOG_TAG} Client {} registered as {}", client_id, identity);
        self.send_to(client_id, SignalMessage::Registered { identity });
    }

    fn open(&self, client_id: Uuid, link_id: Uuid, target: String, kind: LinkKind) {
        let Some(from) = self.identity_of(client_id) else {
            self.send_to(
                client_id,
                SignalMessage::Error {
                    message: "register before opening links".to_string(),
                },
            );
            return;
        };

        let target_id = self.identities.get(&target).map(|entry| *entry.value());
        let target_id = match target_id {
            Some(id) if id != client_id => id,
            _ => {
                tracing::info!("{LOG_TAG} {} tried to reach unavailable peer {}", from, target);
                self.send_to(client_id, SignalMessage::PeerUnavailable { link_id, target });
                return;
            }
        };

        self.links.insert(
            link_id,
            LinkRoute {
                kind,
                initiator: client_id,
                target: target_id,
            },
        );
        tracing::info!("{LOG_TAG} {:?} link {} opened: {} -> {}", kind, link_id, from, target);

        self.send_to(
            target_id,
            SignalMessage::Incoming {
                link_id,
                from,
                kind,
            },
        );
        self.send_to(target_id, SignalMessage::Opened { link_id });
        self.send_to(client_id, SignalMessage::Opened { link_id });
    }

    fn accept(&self, client_id: Uuid, link_id: Uuid) {
        let route = self.links.get(&link_id).map(|entry| *entry.value());
        match route {
            Some(route) if route.kind == LinkKind::Call && route.target == client_id => {
                self.send_to(route.initiator, SignalMessage::Accepted { link_id });
            }
            _ => tracing::debug!("{LOG_TAG} Ignoring accept for link {}", link_id),
        }
    }

    fn relay(&self, client_id: Uuid, link_id: Uuid, data: String) {
        let other = self
            .links
            .get(&link_id)
            .and_then(|entry| entry.value().other_end(client_id));
        match other {
            Some(other) => self.send_to(other, SignalMessage::Data { link_id, data }),
            None => tracing::debug!("{LOG_TAG} Dropping data for unknown link {}", link_id),
        }
    }

    fn close_link(&self, client_id: Uuid, link_id: Uuid) {
        let other = match self.links.get(&link_id) {
            Some(entry) => entry.value().other_end(client_id),
            None => return,
        };
        if let Some(other) = other {
            self.links.remove(&link_id);
            self.send_to(other, SignalMessage::Closed { link_id });
            tracing::info!("{LOG_TAG} Link {} closed by client {}", link_id, client_id);
        }
    }

    fn unregister(&self, client_id: Uuid) {
        let identity = self
            .clients
            .get_mut(&client_id)
            .and_then(|mut entry| entry.identity.take());
        if let Some(identity) = identity {
            self.identities
                .remove_if(&identity, |_, owner| *owner == client_id);
            tracing::info!("{LOG_TAG} Identity {} released", identity);
        }

        let affected: Vec<(Uuid, Uuid)> = self
            .links
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .other_end(client_id)
                    .map(|other| (*entry.key(), other))
            })
            .collect();
        for (link_id, other) in affected {
            self.links.remove(&link_id);
            self.send_to(other, SignalMessage::Closed { link_id });
        }
    }
}
