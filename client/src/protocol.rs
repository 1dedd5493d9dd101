use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::catalog::Language;

/// Messages exchanged between the two participants over the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SyncMessage {
    #[serde(rename = "CODE_CHANGE")]
    CodeChange(String),
    #[serde(rename = "LANG_CHANGE")]
    LanguageChange { language: Language, code: String },
    #[serde(rename = "SYNC_STATE", rename_all = "camelCase")]
    SyncState {
        code: String,
        language: Language,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        question_id: Option<String>,
    },
    #[serde(rename = "QUESTION_CHANGE", rename_all = "camelCase")]
    QuestionChange {
        question_id: String,
        code: String,
        language: Language,
    },
    #[serde(rename = "CHAT_MESSAGE")]
    ChatMessage(ChatMessage),
    #[serde(rename = "ALERT")]
    Alert { text: String },
}

/// Every `type` tag this build understands. Anything else is skipped.
const SYNC_MESSAGE_TYPES: &[&str] = &[
    "CODE_CHANGE",
    "LANG_CHANGE",
    "SYNC_STATE",
    "QUESTION_CHANGE",
    "CHAT_MESSAGE",
    "ALERT",
];

impl SyncMessage {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize sync message")
    }

    /// Parse one channel payload. Returns `Ok(None)` for a well-formed
    /// envelope whose `type` is not known here.
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(text).context("Channel payload is not JSON")?;
        let known = value
            .get("type")
            .and_then(Value::as_str)
            .map(|tag| SYNC_MESSAGE_TYPES.contains(&tag))
            .unwrap_or(false);
        if !known {
            return Ok(None);
        }
        let msg = serde_json::from_value(value).context("Malformed sync message payload")?;
        Ok(Some(msg))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::CodeChange(_) => "CODE_CHANGE",
            SyncMessage::LanguageChange { .. } => "LANG_CHANGE",
            SyncMessage::SyncState { .. } => "SYNC_STATE",
            SyncMessage::QuestionChange { .. } => "QUESTION_CHANGE",
            SyncMessage::ChatMessage(_) => "CHAT_MESSAGE",
            SyncMessage::Alert { .. } => "ALERT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: String,
    pub text: String,
    /// Unix milliseconds at the sender.
    pub timestamp: u64,
}

/// Which of the two link types a signaling link carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Channel,
    Call,
}

/// Messages sent between a participant and the signaling relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalMessage {
    // Client -> Relay
    Register {
        identity: String,
    },
    #[serde(rename_all = "camelCase")]
    Open {
        link_id: Uuid,
        target: String,
        kind: LinkKind,
    },
    #[serde(rename_all = "camelCase")]
    Accept {
        link_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    Data {
        link_id: Uuid,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Close {
        link_id: Uuid,
    },
    Unregister,

    // Relay -> Client
    Registered {
        identity: String,
    },
    IdentityTaken {
        identity: String,
    },
    #[serde(rename_all = "camelCase")]
    Incoming {
        link_id: Uuid,
        from: String,
        kind: LinkKind,
    },
    #[serde(rename_all = "camelCase")]
    Opened {
        link_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    Accepted {
        link_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    PeerUnavailable {
        link_id: Uuid,
        target: String,
    },
    #[serde(rename_all = "camelCase")]
    Closed {
        link_id: Uuid,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        let msg = SyncMessage::CodeChange("ab".into());
        assert_eq!(msg.encode().unwrap(), r#"{"type":"CODE_CHANGE","payload":"ab"}"#);

        let msg = SyncMessage::SyncState {
            code: "x".into(),
            language: Language::Python,
            question_id: Some("two-sum".into()),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "SYNC_STATE");
        assert_eq!(value["payload"]["questionId"], "two-sum");
        assert_eq!(value["payload"]["language"], "python");

        let lang = SyncMessage::LanguageChange {
            language: Language::Java,
            code: "class Main {}".into(),
        };
        assert!(lang.encode().unwrap().starts_with(r#"{"type":"LANG_CHANGE""#));
    }

    #[test]
    fn test_decode_known_messages() {
        let msg = SyncMessage::decode(
            r#"{"type":"QUESTION_CHANGE","payload":{"questionId":"palindrome","code":"c","language":"java"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Some(SyncMessage::QuestionChange {
                question_id: "palindrome".into(),
                code: "c".into(),
                language: Language::Java,
            })
        );

        let state = SyncMessage::decode(
            r#"{"type":"SYNC_STATE","payload":{"code":"","language":"javascript"}}"#,
        )
        .unwrap();
        assert!(matches!(
            state,
            Some(SyncMessage::SyncState { question_id: None, .. })
        ));
    }

    #[test]
    fn test_decode_unknown_type_is_ignored() {
        assert_eq!(
            SyncMessage::decode(r#"{"type":"CURSOR_MOVE","payload":{"line":3}}"#).unwrap(),
            None
        );
        assert_eq!(SyncMessage::decode(r#"{"payload":1}"#).unwrap(), None);
        assert!(SyncMessage::decode("not json").is_err());
        assert!(SyncMessage::decode(r#"{"type":"ALERT","payload":42}"#).is_err());
    }

    #[test]
    fn test_signal_message_shape() {
        let link_id = Uuid::new_v4();
        let json = serde_json::to_string(&SignalMessage::PeerUnavailable {
            link_id,
            target: "42-7-candidate".into(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"PEER_UNAVAILABLE""#));
        assert!(json.contains(r#""linkId""#));

        let parsed: SignalMessage = serde_json::from_str(r#"{"type":"UNREGISTER"}"#).unwrap();
        assert_eq!(parsed, SignalMessage::Unregister);
    }
}
