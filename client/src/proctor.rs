use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::VISIBILITY_ALERT_TEXT;
use crate::identity::Role;
use crate::sync::Synchronizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Environment signal: whether the interview window is in the foreground.
/// Handlers subscribe explicitly and must unsubscribe on teardown.
#[derive(Clone)]
pub struct VisibilitySource {
    inner: Arc<VisibilityState>,
}

struct VisibilityState {
    current: Mutex<Visibility>,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Visibility>>>,
}

impl VisibilitySource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(VisibilityState {
                current: Mutex::new(Visibility::Visible),
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn current(&self) -> Visibility {
        *self.inner.current.lock()
    }

    /// Record a new value; subscribers hear about changes only.
    pub fn set(&self, visibility: Visibility) {
        {
            let mut current = self.inner.current.lock();
            if *current == visibility {
                return;
            }
            *current = visibility;
        }
        self.inner
            .subscribers
            .lock()
            .retain(|_, tx| tx.send(visibility).is_ok());
    }

    pub fn subscribe(&self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<Visibility>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(id, tx);
        (
            SubscriptionHandle {
                source: Arc::clone(&self.inner),
                id: Some(id),
            },
            rx,
        )
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl Default for VisibilitySource {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SubscriptionHandle {
    source: Arc<VisibilityState>,
    id: Option<u64>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&mut self) {
        if let Some(id) = self.id.take() {
            self.source.subscribers.lock().remove(&id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Tells the interviewer each time the candidate's window goes to the
/// background. One alert per transition, nothing shown locally.
pub struct ProctorMonitor {
    subscription: SubscriptionHandle,
    task: Option<JoinHandle<()>>,
}

impl ProctorMonitor {
    /// Returns `None` for roles that are not proctored.
    pub fn start(
        role: Role,
        source: &VisibilitySource,
        sync: Arc<Mutex<Synchronizer>>,
    ) -> Option<Self> {
        if role != Role::Candidate {
            return None;
        }
        let (subscription, mut changes) = source.subscribe();
        let task = tokio::spawn(async move {
            while let Some(visibility) = changes.recv().await {
                if visibility != Visibility::Hidden {
                    continue;
                }
                let sent = sync.lock().send_alert(VISIBILITY_ALERT_TEXT);
                if sent {
                    tracing::info!("Visibility alert sent");
                } else {
                    tracing::debug!("Visibility lost with no open channel");
                }
            }
        });
        tracing::debug!("Proctoring monitor started");
        Some(Self {
            subscription,
            task: Some(task),
        })
    }

    pub fn stop(&mut self) {
        self.subscription.unsubscribe();
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Proctoring monitor stopped");
        }
    }
}

impl Drop for ProctorMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::hub::SignalHub;
    use crate::link::ChannelEvent;
    use crate::protocol::SyncMessage;
    use crate::signal::{IncomingLink, SignalClient};

    #[test]
    fn test_source_reports_transitions_only() {
        let source = VisibilitySource::new();
        let (mut handle, mut rx) = source.subscribe();
        source.set(Visibility::Visible);
        source.set(Visibility::Hidden);
        source.set(Visibility::Hidden);
        source.set(Visibility::Visible);
        assert_eq!(rx.try_recv().ok(), Some(Visibility::Hidden));
        assert_eq!(rx.try_recv().ok(), Some(Visibility::Visible));
        assert!(rx.try_recv().is_err());

        assert_eq!(source.subscriber_count(), 1);
        handle.unsubscribe();
        assert_eq!(source.subscriber_count(), 0);
        drop(handle);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_interviewer_is_not_monitored() {
        let source = VisibilitySource::new();
        let (sync, _) = Synchronizer::new(Arc::new(Catalog::builtin()), "Grace");
        let monitor = ProctorMonitor::start(Role::Interviewer, &source, Arc::new(Mutex::new(sync)));
        assert!(monitor.is_none());
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_alert_per_hidden_transition() {
        let hub = SignalHub::new();
        let candidate = SignalClient::connect_hub(&hub);
        let interviewer = SignalClient::connect_hub(&hub);
        let _ = candidate.register("5-candidate").await.unwrap();
        let mut incoming = interviewer.register("5-interviewer").await.unwrap();
        let channel = candidate.connect("5-interviewer").await.unwrap();

        let (sync, _) = Synchronizer::new(Arc::new(Catalog::builtin()), "Ada");
        let sync = Arc::new(Mutex::new(sync));
        sync.lock().attach_channel(channel.sender(), false);

        let source = VisibilitySource::new();
        let mut monitor = ProctorMonitor::start(Role::Candidate, &source, Arc::clone(&sync))
            .expect("candidate is monitored");
        source.set(Visibility::Hidden);
        source.set(Visibility::Visible);
        source.set(Visibility::Hidden);

        let mut inbound = match incoming.recv().await {
            Some(IncomingLink::Connection(channel)) => channel,
            _ => panic!("expected a channel"),
        };
        assert_eq!(inbound.next_event().await, Some(ChannelEvent::Open));
        for _ in 0..2 {
            match inbound.next_event().await {
                Some(ChannelEvent::Data(text)) => assert_eq!(
                    SyncMessage::decode(&text).unwrap(),
                    Some(SyncMessage::Alert {
                        text: VISIBILITY_ALERT_TEXT.to_string()
                    })
                ),
                other => panic!("unexpected {other:?}"),
            }
        }

        assert!(sync.lock().active_alerts(tokio::time::Instant::now()).is_empty());
        monitor.stop();
        assert_eq!(source.subscriber_count(), 0);
    }
}
