//! Shared editor state and the reducer that keeps both participants' copies
//! converged over the message channel.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::alerts::{Alert, AlertBoard};
use crate::catalog::{Catalog, Language};
use crate::constants::ALERT_TTL;
use crate::link::ChannelSender;
use crate::protocol::{ChatMessage, SyncMessage};
use crate::utils::current_unix_millis;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedState {
    pub code: String,
    pub language: Language,
    pub active_question_id: Option<String>,
}

impl SharedState {
    /// First catalog question in JavaScript, or the bare boilerplate.
    pub fn initial(catalog: &Catalog) -> Self {
        let language = Language::default();
        match catalog.first() {
            Some(question) => Self {
                code: question
                    .starter_for(language)
                    .map(str::to_string)
                    .unwrap_or_else(|| language.boilerplate().to_string()),
                language,
                active_question_id: Some(question.id.clone()),
            },
            None => Self {
                code: language.boilerplate().to_string(),
                language,
                active_question_id: None,
            },
        }
    }
}

/// What changed locally as a result of a remote message.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    State(SharedState),
    Chat(ChatMessage),
    Alert(Alert),
}

pub struct Synchronizer {
    catalog: Arc<Catalog>,
    sender_name: String,
    state: SharedState,
    chat: Vec<ChatMessage>,
    chat_focused: bool,
    unread: bool,
    alerts: AlertBoard,
    channel: Option<ChannelSender>,
    notices: mpsc::UnboundedSender<SyncNotice>,
}

impl Synchronizer {
    pub fn new(
        catalog: Arc<Catalog>,
        sender_name: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let state = SharedState::initial(&catalog);
        (
            Self {
                catalog,
                sender_name: sender_name.into(),
                state,
                chat: Vec::new(),
                chat_focused: false,
                unread: false,
                alerts: AlertBoard::new(ALERT_TTL),
                channel: None,
                notices,
            },
            rx,
        )
    }

    pub fn snapshot(&self) -> SharedState {
        self.state.clone()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn chat_log(&self) -> &[ChatMessage] {
        &self.chat
    }

    pub fn has_unread_chat(&self) -> bool {
        self.unread
    }

    /// Focusing the chat view clears the unread marker.
    pub fn set_chat_focused(&mut self, focused: bool) {
        self.chat_focused = focused;
        if focused {
            self.unread = false;
        }
    }

    pub fn active_alerts(&mut self, now: Instant) -> Vec<Alert> {
        self.alerts.prune(now);
        self.alerts.active(now)
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel.as_ref().map(|c| c.is_open()).unwrap_or(false)
    }

    /// Start mirroring over `channel`. With `bootstrap`, the current state
    /// goes out before anything else.
    pub fn attach_channel(&mut self, channel: ChannelSender, bootstrap: bool) {
        tracing::info!("Sync channel to {} attached", channel.remote());
        self.channel = Some(channel);
        if bootstrap {
            self.send(SyncMessage::SyncState {
                code: self.state.code.clone(),
                language: self.state.language,
                question_id: self.state.active_question_id.clone(),
            });
        }
    }

    pub fn detach_channel(&mut self) {
        if self.channel.take().is_some() {
            tracing::info!("Sync channel detached");
        }
    }

    pub fn receive(&mut self, text: &str) {
        self.receive_at(text, Instant::now());
    }

    /// Decode and apply one channel payload.
    pub fn receive_at(&mut self, text: &str, now: Instant) {
        match SyncMessage::decode(text) {
            Ok(Some(msg)) => self.apply(msg, now),
            Ok(None) => tracing::debug!("Ignoring unknown sync message"),
            Err(e) => tracing::warn!("Dropping sync message: {e:#}"),
        }
    }

    pub fn apply(&mut self, msg: SyncMessage, now: Instant) {
        tracing::debug!("Applying {}", msg.kind());
        match msg {
            SyncMessage::CodeChange(code) => {
                self.state.code = code;
                self.notify_state();
            }
            SyncMessage::LanguageChange { language, code } => {
                self.state.language = language;
                self.state.code = code;
                self.notify_state();
            }
            SyncMessage::SyncState {
                code,
                language,
                question_id,
            } => {
                self.state.code = code;
                self.state.language = language;
                if let Some(id) = question_id.filter(|id| self.catalog.find(id).is_some()) {
                    self.state.active_question_id = Some(id);
                }
                self.notify_state();
            }
            SyncMessage::QuestionChange {
                question_id,
                code,
                language,
            } => {
                if self.catalog.find(&question_id).is_none() {
                    tracing::debug!("Ignoring change to unknown question {}", question_id);
                    return;
                }
                self.state.active_question_id = Some(question_id);
                self.state.language = language;
                self.state.code = code;
                self.notify_state();
            }
            SyncMessage::ChatMessage(chat) => {
                if !self.chat_focused {
                    self.unread = true;
                }
                self.chat.push(chat.clone());
                let _ = self.notices.send(SyncNotice::Chat(chat));
            }
            SyncMessage::Alert { text } => {
                let alert = self.alerts.push(text, now);
                let _ = self.notices.send(SyncNotice::Alert(alert));
            }
        }
    }

    pub fn edit_code(&mut self, code: impl Into<String>) {
        self.state.code = code.into();
        self.send(SyncMessage::CodeChange(self.state.code.clone()));
    }

    pub fn change_language(&mut self, language: Language) {
        let code = self
            .catalog
            .starter_code(self.state.active_question_id.as_deref(), language);
        self.state.language = language;
        self.state.code = code.clone();
        self.send(SyncMessage::LanguageChange { language, code });
    }

    /// Switch problems, resetting the code to its starter. Returns false for
    /// an id the catalog doesn't know.
    pub fn change_question(&mut self, question_id: &str) -> bool {
        let Some(question) = self.catalog.find(question_id) else {
            return false;
        };
        let language = self.state.language;
        let code = question
            .starter_for(language)
            .map(str::to_string)
            .unwrap_or_else(|| language.boilerplate().to_string());
        self.state.active_question_id = Some(question.id.clone());
        self.state.code = code.clone();
        self.send(SyncMessage::QuestionChange {
            question_id: question_id.to_string(),
            code,
            language,
        });
        true
    }

    /// Append to our own log and mirror. Blank text is ignored.
    pub fn send_chat(&mut self, text: &str) -> Option<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let chat = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender: self.sender_name.clone(),
            text: text.to_string(),
            timestamp: current_unix_millis(),
        };
        self.chat.push(chat.clone());
        self.send(SyncMessage::ChatMessage(chat.clone()));
        Some(chat)
    }

    /// Alerts are for the other side only; nothing is shown here.
    pub fn send_alert(&mut self, text: &str) -> bool {
        self.send(SyncMessage::Alert {
            text: text.to_string(),
        })
    }

    fn notify_state(&self) {
        let _ = self.notices.send(SyncNotice::State(self.state.clone()));
    }

    fn send(&self, msg: SyncMessage) -> bool {
        let Some(channel) = self.channel.as_ref().filter(|c| c.is_open()) else {
            return false;
        };
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode {}: {e:#}", msg.kind());
                return false;
            }
        };
        match channel.send(text) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("{} stayed local: {}", msg.kind(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::SignalHub;
    use crate::link::ChannelEvent;
    use crate::signal::{IncomingLink, SignalClient};
    use std::time::Duration;

    fn synchronizer() -> (Synchronizer, mpsc::UnboundedReceiver<SyncNotice>) {
        Synchronizer::new(Arc::new(Catalog::builtin()), "Ada")
    }

    #[test]
    fn test_initial_state() {
        let (sync, _) = synchronizer();
        let state = sync.snapshot();
        assert_eq!(state.language, Language::Javascript);
        assert_eq!(state.active_question_id.as_deref(), Some("two-sum"));
        assert!(state.code.contains("twoSum"));
        assert_eq!(
            SharedState::initial(&Catalog::default()).code,
            Language::Javascript.boilerplate()
        );
    }

    #[test]
    fn test_reducer_table() {
        let (mut sync, mut notices) = synchronizer();
        let now = Instant::now();

        sync.apply(SyncMessage::CodeChange("a".into()), now);
        assert_eq!(sync.snapshot().code, "a");

        sync.apply(
            SyncMessage::LanguageChange {
                language: Language::Java,
                code: "class A {}".into(),
            },
            now,
        );
        assert_eq!(sync.snapshot().language, Language::Java);
        assert_eq!(sync.snapshot().code, "class A {}");

        sync.apply(
            SyncMessage::SyncState {
                code: "x".into(),
                language: Language::Python,
                question_id: Some("no-such-question".into()),
            },
            now,
        );
        let state = sync.snapshot();
        assert_eq!(state.code, "x");
        assert_eq!(state.language, Language::Python);
        assert_eq!(state.active_question_id.as_deref(), Some("two-sum"));

        sync.apply(
            SyncMessage::QuestionChange {
                question_id: "missing".into(),
                code: "ignored".into(),
                language: Language::Java,
            },
            now,
        );
        assert_eq!(sync.snapshot(), state);

        sync.apply(
            SyncMessage::QuestionChange {
                question_id: "palindrome".into(),
                code: "p".into(),
                language: Language::Java,
            },
            now,
        );
        assert_eq!(
            sync.snapshot(),
            SharedState {
                code: "p".into(),
                language: Language::Java,
                active_question_id: Some("palindrome".into()),
            }
        );

        let mut states = 0;
        while let Ok(notice) = notices.try_recv() {
            assert!(matches!(notice, SyncNotice::State(_)));
            states += 1;
        }
        assert_eq!(states, 4);
    }

    #[test]
    fn test_chat_marks_unread_when_unfocused() {
        let (mut sync, _) = synchronizer();
        let chat = ChatMessage {
            id: "1".into(),
            sender: "Grace".into(),
            text: "hi".into(),
            timestamp: 0,
        };
        sync.set_chat_focused(true);
        sync.apply(SyncMessage::ChatMessage(chat.clone()), Instant::now());
        assert!(!sync.has_unread_chat());

        sync.set_chat_focused(false);
        sync.apply(SyncMessage::ChatMessage(chat), Instant::now());
        assert!(sync.has_unread_chat());
        assert_eq!(sync.chat_log().len(), 2);

        sync.set_chat_focused(true);
        assert!(!sync.has_unread_chat());
    }

    #[test]
    fn test_alert_expires_after_window() {
        let (mut sync, _) = synchronizer();
        let t = Instant::now();
        sync.apply(SyncMessage::Alert { text: "away".into() }, t);
        assert_eq!(sync.active_alerts(t + Duration::from_millis(4999)).len(), 1);
        assert!(sync.active_alerts(t + Duration::from_millis(5000)).is_empty());
    }

    #[test]
    fn test_unknown_message_changes_nothing() {
        let (mut sync, mut notices) = synchronizer();
        let before = sync.snapshot();
        let now = Instant::now();
        sync.receive_at(r#"{"type":"CURSOR_MOVE","payload":{"line":3}}"#, now);
        sync.receive_at("not json", now);
        sync.receive_at(r#"{"type":"CODE_CHANGE","payload":7}"#, now);
        assert_eq!(sync.snapshot(), before);
        assert!(sync.chat_log().is_empty());
        assert!(sync.active_alerts(now).is_empty());
        assert!(notices.try_recv().is_err());
    }

    #[test]
    fn test_local_mutations_without_channel_stay_local() {
        let (mut sync, _) = synchronizer();
        sync.edit_code("print(1)");
        sync.change_language(Language::Python);
        assert_eq!(sync.snapshot().code, "# Two Sum\ndef two_sum(nums, target):\n    pass");
        assert!(sync.change_question("reverse-ll"));
        assert!(!sync.change_question("nope"));
        assert_eq!(sync.snapshot().active_question_id.as_deref(), Some("reverse-ll"));
        assert!(sync.snapshot().code.contains("reverse_list"));
        assert!(sync.send_chat("  hello ").is_some());
        assert!(sync.send_chat("   ").is_none());
        assert_eq!(sync.chat_log()[0].text, "hello");
        assert!(!sync.send_alert("away"));
    }

    #[tokio::test]
    async fn test_bootstrap_converges_joiner() {
        let hub = SignalHub::new();
        let initiator = SignalClient::connect_hub(&hub);
        let joiner = SignalClient::connect_hub(&hub);
        let _ = initiator.register("9-interviewer").await.unwrap();
        let mut incoming = joiner.register("9-candidate").await.unwrap();

        let (mut lead, _) = synchronizer();
        lead.change_question("palindrome");
        lead.change_language(Language::Python);
        lead.edit_code("def is_palindrome(s): return s == s[::-1]");

        let channel = initiator.connect("9-candidate").await.unwrap();
        lead.attach_channel(channel.sender(), true);
        lead.edit_code("x");

        let mut inbound = match incoming.recv().await {
            Some(IncomingLink::Connection(channel)) => channel,
            _ => panic!("expected a channel"),
        };
        let (mut follower, _) = synchronizer();
        assert_eq!(inbound.next_event().await, Some(ChannelEvent::Open));
        match inbound.next_event().await {
            Some(ChannelEvent::Data(text)) => {
                assert!(matches!(
                    SyncMessage::decode(&text).unwrap(),
                    Some(SyncMessage::SyncState { .. })
                ));
                follower.receive(&text);
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut expected = lead.snapshot();
        expected.code = "def is_palindrome(s): return s == s[::-1]".into();
        assert_eq!(follower.snapshot(), expected);

        match inbound.next_event().await {
            Some(ChannelEvent::Data(text)) => follower.receive(&text),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(follower.snapshot(), lead.snapshot());
    }
}
