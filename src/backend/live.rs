//! # Live Backend Wire Client
//!
//! Speaks the AI backend's bidirectional streaming protocol over a
//! WebSocket (tokio-tungstenite):
//!
//! 1. **Handshake**: dial the configured endpoint (API key as query
//!    parameter), send a `setup` message naming the model, audio response
//!    modality and system instruction, then wait for `setupComplete`.
//!    Anything else — timeout, refusal, protocol noise — is a
//!    `BackendHandshakeFailure` and fatal for the session.
//! 2. **Writer task**: drains [`BackendCommand`]s in order. Text prompts
//!    become `clientContent` turns with `turnComplete: true`; audio chunks
//!    become `realtimeInput.mediaChunks` with base64 PCM and an explicit
//!    `audio/pcm;rate=N` mime type.
//! 3. **Reader task**: parses `serverContent` frames into [`BackendEvent`]s —
//!    base64 `inlineData` becomes `Audio`, `turnComplete` becomes
//!    `TurnComplete`, and stream end or error becomes a terminal `Closed`.
//!
//! Both tasks end when their channel or the socket goes away; dropping the
//! command sender is enough to wind the connection down cooperatively.

use crate::config::BackendConfig;
use crate::error::{RelayError, RelayResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{BackendCommand, BackendConnection, BackendEvent};

/// Connector for the live AI speech backend.
pub struct LiveBackendClient;

impl LiveBackendClient {
    /// Open a backend connection for one session.
    ///
    /// Performs the full setup handshake before returning, so a successful
    /// result means the backend is ready for turns. The returned
    /// [`BackendConnection`] is exclusively owned by the calling session.
    pub async fn connect(
        config: &BackendConfig,
        input_sample_rate: u32,
    ) -> RelayResult<BackendConnection> {
        let url = match &config.api_key {
            Some(key) => format!("{}?key={}", config.url, key),
            None => config.url.clone(),
        };
        let timeout = Duration::from_secs(config.connect_timeout_secs);

        let (ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| {
                RelayError::BackendHandshakeFailure(format!(
                    "backend did not accept the connection within {}s",
                    config.connect_timeout_secs
                ))
            })?
            .map_err(|e| RelayError::BackendHandshakeFailure(e.to_string()))?;

        let (mut sink, mut stream) = ws.split();

        let setup = setup_message(&config.model, &config.system_instruction);
        sink.send(Message::Text(setup))
            .await
            .map_err(|e| RelayError::BackendHandshakeFailure(e.to_string()))?;

        // The first frame back must acknowledge the setup.
        let first = tokio::time::timeout(timeout, stream.next())
            .await
            .map_err(|_| {
                RelayError::BackendHandshakeFailure("setup acknowledgement timed out".to_string())
            })?;

        match first {
            Some(Ok(msg)) => {
                let payload = message_payload(&msg);
                if !is_setup_complete(&payload) {
                    return Err(RelayError::BackendHandshakeFailure(format!(
                        "unexpected setup response: {}",
                        String::from_utf8_lossy(&payload)
                    )));
                }
            }
            Some(Err(e)) => {
                return Err(RelayError::BackendHandshakeFailure(e.to_string()));
            }
            None => {
                return Err(RelayError::BackendHandshakeFailure(
                    "backend closed the stream during setup".to_string(),
                ));
            }
        }

        info!(model = %config.model, "Backend handshake complete");

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<BackendCommand>();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel::<BackendEvent>();

        // Writer: drains commands in order onto the socket.
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let frame = match cmd {
                    BackendCommand::SendText(text) => {
                        Message::Text(client_content_message(&text))
                    }
                    BackendCommand::SendAudio(pcm) => {
                        Message::Text(realtime_input_message(&pcm, input_sample_rate))
                    }
                    BackendCommand::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };

                if let Err(e) = sink.send(frame).await {
                    warn!("Backend write failed: {}", e);
                    break;
                }
            }
            debug!("Backend writer task finished");
        });

        // Reader: turns server frames into ordered events.
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(txt)) => {
                        for event in parse_server_message(txt.as_bytes()) {
                            if evt_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    // Some backends ship JSON in binary frames.
                    Ok(Message::Binary(bin)) => {
                        for event in parse_server_message(&bin) {
                            if evt_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("Backend closed the stream: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Backend stream error: {}", e);
                        let _ = evt_tx.send(BackendEvent::Closed(e.to_string()));
                        return;
                    }
                }
            }
            let _ = evt_tx.send(BackendEvent::Closed("backend stream ended".to_string()));
        });

        Ok(BackendConnection::from_parts(cmd_tx, evt_rx))
    }
}

/// The session-opening `setup` message.
fn setup_message(model: &str, system_instruction: &str) -> String {
    json!({
        "setup": {
            "model": model,
            "generationConfig": {
                "responseModalities": ["AUDIO"]
            },
            "systemInstruction": {
                "parts": [{ "text": system_instruction }]
            }
        }
    })
    .to_string()
}

/// One complete text turn, closed immediately so the backend responds.
fn client_content_message(text: &str) -> String {
    json!({
        "clientContent": {
            "turns": [{
                "role": "user",
                "parts": [{ "text": text }]
            }],
            "turnComplete": true
        }
    })
    .to_string()
}

/// One chunk of streaming input audio, base64-encoded raw PCM.
fn realtime_input_message(pcm: &[u8], sample_rate: u32) -> String {
    json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": format!("audio/pcm;rate={}", sample_rate),
                "data": BASE64.encode(pcm)
            }]
        }
    })
    .to_string()
}

fn message_payload(msg: &Message) -> Vec<u8> {
    match msg {
        Message::Text(txt) => txt.as_bytes().to_vec(),
        Message::Binary(bin) => bin.clone(),
        _ => Vec::new(),
    }
}

fn is_setup_complete(payload: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(payload)
        .map(|v| v.get("setupComplete").is_some())
        .unwrap_or(false)
}

/// Parse one server frame into zero or more events, in payload order.
///
/// Unknown fields are ignored; a frame that is not JSON yields nothing —
/// the backend's chatter must never take the session down.
fn parse_server_message(payload: &[u8]) -> Vec<BackendEvent> {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unparseable backend frame dropped: {}", e);
            return Vec::new();
        }
    };

    let mut events = Vec::new();

    if let Some(server_content) = value.get("serverContent") {
        if let Some(parts) = server_content
            .get("modelTurn")
            .and_then(|t| t.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(data) = part
                    .get("inlineData")
                    .and_then(|d| d.get("data"))
                    .and_then(|d| d.as_str())
                {
                    match BASE64.decode(data) {
                        Ok(bytes) => events.push(BackendEvent::Audio(bytes)),
                        Err(e) => warn!("Undecodable backend audio payload dropped: {}", e),
                    }
                }

                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    debug!("Backend text part: {}", text);
                }
            }
        }

        if server_content
            .get("turnComplete")
            .and_then(|t| t.as_bool())
            .unwrap_or(false)
        {
            events.push(BackendEvent::TurnComplete);
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_message_shape() {
        let msg = setup_message("models/test-model", "Be brief.");
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();

        assert_eq!(value["setup"]["model"], "models/test-model");
        assert_eq!(
            value["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            value["setup"]["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
    }

    #[test]
    fn test_client_content_closes_the_turn() {
        let msg = client_content_message("hello");
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();

        assert_eq!(value["clientContent"]["turnComplete"], true);
        assert_eq!(
            value["clientContent"]["turns"][0]["parts"][0]["text"],
            "hello"
        );
        assert_eq!(value["clientContent"]["turns"][0]["role"], "user");
    }

    #[test]
    fn test_realtime_input_carries_base64_pcm() {
        let pcm = vec![0x01u8, 0x02, 0x03, 0x04];
        let msg = realtime_input_message(&pcm, 16_000);
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();

        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        let decoded = BASE64.decode(chunk["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn test_setup_complete_detection() {
        assert!(is_setup_complete(br#"{"setupComplete": {}}"#));
        assert!(!is_setup_complete(br#"{"serverContent": {}}"#));
        assert!(!is_setup_complete(b"not json"));
    }

    #[test]
    fn test_parse_audio_and_turn_complete_in_order() {
        let audio = BASE64.encode([0u8, 1, 2, 3]);
        let frame = format!(
            r#"{{"serverContent": {{
                "modelTurn": {{"parts": [
                    {{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{}"}}}},
                    {{"text": "spoken words"}}
                ]}},
                "turnComplete": true
            }}}}"#,
            audio
        );

        let events = parse_server_message(frame.as_bytes());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], BackendEvent::Audio(vec![0, 1, 2, 3]));
        assert_eq!(events[1], BackendEvent::TurnComplete);
    }

    #[test]
    fn test_parse_ignores_unknown_frames() {
        assert!(parse_server_message(br#"{"toolCall": {"x": 1}}"#).is_empty());
        assert!(parse_server_message(b"garbage").is_empty());
    }
}
