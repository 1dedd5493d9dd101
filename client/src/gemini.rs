//! Gemini Live (bidirectional audio) and one-shot generateContent clients.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::constants::{GEMINI_LIVE_URL, GEMINI_REST_URL, TEXT_MODEL};
use crate::engine::{
    input_channel, EngineError, LiveConfig, LiveEngine, LiveEvent, LiveSession, RealtimeInput,
};

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct GeminiLive {
    api_key: String,
    endpoint: String,
}

impl GeminiLive {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, GEMINI_LIVE_URL)
    }

    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }

    fn session_url(&self) -> Result<url::Url, EngineError> {
        let mut url =
            url::Url::parse(&self.endpoint).map_err(|e| EngineError::Connect(e.to_string()))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

pub fn setup_message(config: &LiveConfig) -> Value {
    json!({
        "setup": {
            "model": config.model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": config.voice_name }
                    }
                }
            },
            "systemInstruction": {
                "parts": [{ "text": config.system_instruction }]
            }
        }
    })
}

pub fn realtime_message(input: &RealtimeInput) -> Value {
    json!({
        "realtimeInput": {
            "mediaChunks": [{ "mimeType": input.mime_type, "data": input.data }]
        }
    })
}

/// Every inline audio payload in a server message, base64-decoded. Parts
/// that fail to decode are skipped.
pub fn extract_audio(message: &Value) -> Vec<Vec<u8>> {
    message
        .pointer("/serverContent/modelTurn/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.pointer("/inlineData/data").and_then(Value::as_str))
                .filter_map(|data| match STANDARD.decode(data) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        tracing::debug!("Skipping undecodable inline audio: {e}");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The live endpoint sends JSON as either text or binary frames.
fn frame_json(msg: &WsMessage) -> Option<Value> {
    match msg {
        WsMessage::Text(text) => serde_json::from_str(text.as_str()).ok(),
        WsMessage::Binary(bytes) => serde_json::from_slice(bytes).ok(),
        _ => None,
    }
}

#[async_trait]
impl LiveEngine for GeminiLive {
    async fn open_session(&self, config: &LiveConfig) -> Result<LiveSession, EngineError> {
        let url = self.session_url()?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        ws_sender
            .send(WsMessage::Text(setup_message(config).to_string().into()))
            .await
            .map_err(|e| EngineError::Setup(e.to_string()))?;

        // Errors before this point are setup failures; after it they are
        // runtime events on an open session.
        let handshake = async {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(WsMessage::Close(reason)) => {
                        let reason = reason.map(|f| f.reason.to_string()).unwrap_or_default();
                        return Err(EngineError::Setup(format!("closed during setup: {reason}")));
                    }
                    Ok(msg) => {
                        if frame_json(&msg).is_some_and(|v| v.get("setupComplete").is_some()) {
                            return Ok(());
                        }
                    }
                    Err(e) => return Err(EngineError::Setup(e.to_string())),
                }
            }
            Err(EngineError::Closed)
        };
        tokio::time::timeout(SETUP_TIMEOUT, handshake)
            .await
            .map_err(|_| EngineError::Setup("timed out waiting for setupComplete".to_string()))??;
        tracing::info!("Gemini Live session open ({})", config.model);

        let (input_tx, mut input_rx) = input_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<LiveEvent>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    input = input_rx.recv() => match input {
                        Some(input) => {
                            let text = realtime_message(&input).to_string();
                            if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                                let _ = event_tx.send(LiveEvent::Error(e.to_string()));
                                break;
                            }
                        }
                        None => {
                            let _ = ws_sender.close().await;
                            break;
                        }
                    },
                    frame = ws_receiver.next() => match frame {
                        Some(Ok(WsMessage::Close(reason))) => {
                            let reason = reason.map(|f| f.reason.to_string());
                            let _ = event_tx.send(LiveEvent::Closed(reason));
                            break;
                        }
                        Some(Ok(msg)) => {
                            if let Some(value) = frame_json(&msg) {
                                for chunk in extract_audio(&value) {
                                    let _ = event_tx.send(LiveEvent::Audio(chunk));
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = event_tx.send(LiveEvent::Error(e.to_string()));
                            break;
                        }
                        None => {
                            let _ = event_tx.send(LiveEvent::Closed(None));
                            break;
                        }
                    },
                }
            }
            tracing::debug!("Gemini Live transport task finished");
        });

        Ok(LiveSession::new(input_tx, event_rx, Some(task)))
    }
}

/// Plain request/response text generation.
#[derive(Clone)]
pub struct GeminiText {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiText {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("techmeet/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: TEXT_MODEL.to_string(),
            base_url: GEMINI_REST_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub async fn generate(&self, prompt: &str, json_output: bool) -> Result<String> {
        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let mut body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        if json_output {
            body["generationConfig"] = json!({ "responseMimeType": "application/json" });
        }

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .context("Failed to reach generateContent")?;

        if !response.status().is_success() {
            anyhow::bail!("generateContent returned status: {}", response.status());
        }

        let value: Value = response
            .json()
            .await
            .context("Failed to parse generateContent response")?;
        Ok(response_text(&value))
    }
}

/// Concatenated text of the first candidate.
pub fn response_text(value: &Value) -> String {
    value
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_message_shape() {
        let setup = setup_message(&LiveConfig::default());
        assert_eq!(
            setup["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert!(setup["setup"]["model"].as_str().unwrap().starts_with("models/"));
    }

    #[test]
    fn test_extract_audio() {
        let msg = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": STANDARD.encode([1u8, 0, 2, 0]) } },
                        { "text": "hello" },
                        { "inlineData": { "data": "%%%" } }
                    ]
                }
            }
        });
        assert_eq!(extract_audio(&msg), vec![vec![1u8, 0, 2, 0]]);
        assert!(extract_audio(&json!({ "setupComplete": {} })).is_empty());
    }

    #[test]
    fn test_realtime_message_shape() {
        let msg = realtime_message(&RealtimeInput::jpeg(&[1, 2]));
        assert_eq!(msg["realtimeInput"]["mediaChunks"][0]["mimeType"], "image/jpeg");
    }

    #[test]
    fn test_response_text() {
        let value = json!({
            "candidates": [{ "content": { "parts": [{ "text": "4" }, { "text": "2" }] } }]
        });
        assert_eq!(response_text(&value), "42");
        assert_eq!(response_text(&json!({})), "");
    }

    #[test]
    fn test_session_url_carries_key() {
        let live = GeminiLive::with_endpoint("k3y", "wss://example.test/live");
        assert_eq!(live.session_url().unwrap().as_str(), "wss://example.test/live?key=k3y");
    }
}
