//! # WebSocket Voice Relay Handler
//!
//! Handles the duplex voice channel. Clients connect to `/ws/voice` and use
//! one socket for two message kinds:
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: client connects; the server dials the AI backend and
//!    acknowledges with a `voice_status` once the handshake succeeds
//! 2. **Control**: text frames carry JSON with a required `type` field
//!    (turn triggers, status updates, completion markers)
//! 3. **Audio upstream**: binary frames carry one compressed audio chunk
//!    each, converted and streamed to the backend during a continuous turn
//! 4. **Audio downstream**: binary frames carry the backend's raw PCM
//!    response bytes, forwarded unchanged
//!
//! ## Message Format:
//! - **Client → Server**: binary audio chunks, no envelope; JSON control
//! - **Server → Client**: binary raw PCM (24 kHz, 16-bit, mono); JSON control
//!
//! The actor is the frame multiplexer: it classifies inbound frames, feeds
//! the session coordinator, and writes the coordinator's outbound frames in
//! order — control before audio for the same logical event.

use crate::backend::{BackendConnection, BackendEvent, LiveBackendClient};
use crate::audio::codec::AudioCodecBridge;
use crate::session::{Outbound, SessionCoordinator, SessionManager};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Control messages carried in text frames, tagged by `type`.
///
/// Unknown `type` values deserialize to [`Unknown`](Self::Unknown) and are
/// ignored, which keeps the protocol forward-compatible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Client asks for a spoken greeting (single-shot turn)
    #[serde(rename = "ai_greeting")]
    AiGreeting {
        /// Greeting text the backend should speak
        message: String,
    },

    /// Client sends a text prompt to be spoken back (single-shot turn)
    #[serde(rename = "user_message")]
    UserMessage {
        /// Prompt text
        message: String,
    },

    /// Client opens a continuous audio-forwarding turn
    #[serde(rename = "start_realtime_voice")]
    StartRealtimeVoice,

    /// Client closes the continuous turn
    #[serde(rename = "stop_realtime_voice")]
    StopRealtimeVoice,

    /// Informational session status for the client UI
    #[serde(rename = "voice_status")]
    VoiceStatus {
        /// Current status string
        status: String,
    },

    /// End of an AI utterance. `turn_complete` is accepted as an alias.
    #[serde(rename = "ai_turn_complete", alias = "turn_complete")]
    AiTurnComplete,

    /// Acknowledges realtime voice start/stop
    #[serde(rename = "realtime_status")]
    RealtimeStatus {
        /// "started" or "stopped"
        status: String,
    },

    /// Textual fallback completion when audio synthesis produced nothing
    #[serde(rename = "greeting_complete")]
    GreetingComplete {
        /// The text that could not be spoken
        message: String,
    },

    /// Error notification with a stable code
    #[serde(rename = "error")]
    Error {
        /// Error code
        code: String,
        /// Human-readable error message
        message: String,
    },

    /// Heartbeat ping
    #[serde(rename = "ping")]
    Ping {
        /// Timestamp for latency measurement
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Heartbeat pong
    #[serde(rename = "pong")]
    Pong {
        /// Original timestamp from the ping
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Any unrecognized `type` — ignored, state-neutral
    #[serde(other)]
    Unknown,
}

/// WebSocket actor owning one relay session.
///
/// ## Actor Model:
/// Each connection is an independent actor. The backend connect task and the
/// backend drain task talk to it exclusively through its mailbox, so every
/// state transition happens on the actor thread via the coordinator.
pub struct VoiceSocket {
    /// The session state machine; the only place state is mutated
    coordinator: SessionCoordinator,

    /// Shared application state for metrics
    app_state: web::Data<AppState>,

    /// Cross-session capacity tracking
    session_manager: Arc<SessionManager>,

    /// Last heartbeat time
    last_heartbeat: Instant,

    /// Whether this session counted against the capacity limit
    registered: bool,
}

impl VoiceSocket {
    pub fn new(app_state: web::Data<AppState>, session_manager: Arc<SessionManager>) -> Self {
        let target_rate = app_state.get_config().audio.input_sample_rate;
        Self {
            coordinator: SessionCoordinator::new(AudioCodecBridge::new(target_rate)),
            app_state,
            session_manager,
            last_heartbeat: Instant::now(),
            registered: false,
        }
    }

    /// Write the coordinator's outbound frames to the socket, preserving
    /// order: when a control message and audio belong together, the
    /// coordinator puts the control message first and it is written first.
    fn write_outbound(&self, frames: Vec<Outbound>, ctx: &mut ws::WebsocketContext<Self>) {
        for frame in frames {
            match frame {
                Outbound::Control(message) => match serde_json::to_string(&message) {
                    Ok(json) => ctx.text(json),
                    Err(e) => error!("Failed to serialize control message: {}", e),
                },
                Outbound::Audio(bytes) => {
                    self.app_state.record_audio_frame_out();
                    ctx.binary(bytes);
                }
            }
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        let error_msg = ControlMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        };

        if let Ok(json) = serde_json::to_string(&error_msg) {
            ctx.text(json);
        }

        warn!("WebSocket error {}: {}", code, message);
    }
}

/// Backend handshake succeeded; carries the connection for this session.
#[derive(Message)]
#[rtype(result = "()")]
struct BackendReady(BackendConnection);

/// Backend handshake failed; the session must close.
#[derive(Message)]
#[rtype(result = "()")]
struct BackendFailed(String);

/// One event from the backend drain task.
#[derive(Message)]
#[rtype(result = "()")]
struct BackendEventMsg(BackendEvent);

impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts: register the session,
    /// start the heartbeat, and dial the backend off the actor thread.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.coordinator.id(), "Voice session connecting");

        if !self.session_manager.try_register(self.coordinator.id()) {
            self.send_error(
                ctx,
                "server_at_capacity",
                "too many concurrent voice sessions, try again later",
            );
            ctx.stop();
            return;
        }
        self.registered = true;
        self.app_state.record_session_started();

        // Heartbeat: ping every 30s, drop clients silent for 60s.
        ctx.run_interval(Duration::from_secs(30), |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > Duration::from_secs(60) {
                warn!(session_id = %act.coordinator.id(), "Heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }

            let ping = ControlMessage::Ping {
                timestamp: Some(
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64,
                ),
            };
            if let Ok(json) = serde_json::to_string(&ping) {
                ctx.text(json);
            }
        });

        // Dial the backend off the actor thread; the result comes back
        // through the mailbox so only this actor touches session state.
        let config = self.app_state.get_config();
        let addr = ctx.address();
        tokio::spawn(async move {
            match LiveBackendClient::connect(&config.backend, config.audio.input_sample_rate).await
            {
                Ok(connection) => addr.do_send(BackendReady(connection)),
                Err(e) => addr.do_send(BackendFailed(e.to_string())),
            }
        });
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.coordinator.begin_close();
        self.coordinator.finish_close();

        if self.registered {
            self.session_manager.unregister(self.coordinator.id());
            self.app_state.record_session_closed();
        }

        info!(
            session_id = %self.coordinator.id(),
            frames_in = self.coordinator.frames_in(),
            frames_out = self.coordinator.frames_out(),
            dropped = self.coordinator.chunks_dropped(),
            "Voice session ended"
        );
    }
}

/// Frame multiplexer: classify each inbound frame and route it.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(ControlMessage::Pong { .. }) => {
                        self.last_heartbeat = Instant::now();
                    }
                    Ok(message) => {
                        let out = self.coordinator.handle_control(message);
                        self.write_outbound(out, ctx);
                    }
                    // Malformed JSON is logged and dropped; a bad frame
                    // must not terminate the session.
                    Err(e) => {
                        warn!(
                            session_id = %self.coordinator.id(),
                            "Dropping malformed control message: {}", e
                        );
                    }
                }
            }
            Ok(ws::Message::Binary(data)) => {
                self.app_state.record_audio_frame_in();

                let dropped_before = self.coordinator.chunks_dropped();
                let out = self.coordinator.handle_audio(data.to_vec());
                if self.coordinator.chunks_dropped() > dropped_before {
                    self.app_state.record_chunk_dropped();
                }
                self.write_outbound(out, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.coordinator.id(), "WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(session_id = %self.coordinator.id(), "WebSocket protocol error: {}", e);
                ctx.stop();
            }
        }
    }
}

impl Handler<BackendReady> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: BackendReady, ctx: &mut Self::Context) {
        let BackendConnection {
            commands,
            mut events,
        } = msg.0;

        let out = self.coordinator.backend_ready(commands);
        self.write_outbound(out, ctx);

        // Drain task: forwards backend events into the mailbox one at a
        // time, preserving stream order. It ends when either side goes away.
        let addr = ctx.address();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                addr.do_send(BackendEventMsg(event));
            }
            debug!("Backend drain task finished");
        });
    }
}

impl Handler<BackendFailed> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: BackendFailed, ctx: &mut Self::Context) {
        // One descriptive error reaches the client before the socket closes.
        let out = self.coordinator.backend_failed(&msg.0);
        self.write_outbound(out, ctx);
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Error,
            description: Some("backend unavailable".to_string()),
        }));
        ctx.stop();
    }
}

impl Handler<BackendEventMsg> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: BackendEventMsg, ctx: &mut Self::Context) {
        let out = self.coordinator.handle_backend_event(msg.0);
        self.write_outbound(out, ctx);
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Handles the initial HTTP request and upgrades it to a WebSocket
/// connection; everything after the upgrade lives in the [`VoiceSocket`]
/// actor.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
    session_manager: web::Data<SessionManager>,
) -> ActixResult<HttpResponse> {
    info!(
        "New voice WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    let socket = VoiceSocket::new(app_state, session_manager.into_inner());
    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_triggers_deserialize() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"ai_greeting","message":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::AiGreeting {
                message: "hi".to_string()
            }
        );

        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"start_realtime_voice"}"#).unwrap();
        assert_eq!(msg, ControlMessage::StartRealtimeVoice);

        let msg: ControlMessage = serde_json::from_str(r#"{"type":"stop_realtime_voice"}"#).unwrap();
        assert_eq!(msg, ControlMessage::StopRealtimeVoice);
    }

    #[test]
    fn test_turn_complete_alias() {
        let canonical: ControlMessage =
            serde_json::from_str(r#"{"type":"ai_turn_complete"}"#).unwrap();
        let alias: ControlMessage = serde_json::from_str(r#"{"type":"turn_complete"}"#).unwrap();
        assert_eq!(canonical, ControlMessage::AiTurnComplete);
        assert_eq!(alias, ControlMessage::AiTurnComplete);

        // Serialization always uses the canonical name.
        let json = serde_json::to_string(&ControlMessage::AiTurnComplete).unwrap();
        assert!(json.contains("ai_turn_complete"));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"hologram_mode","intensity":11}"#).unwrap();
        assert_eq!(msg, ControlMessage::Unknown);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(serde_json::from_str::<ControlMessage>("{not json").is_err());
        assert!(serde_json::from_str::<ControlMessage>(r#"{"message":"no type"}"#).is_err());
    }

    #[test]
    fn test_status_messages_serialize_with_type_tag() {
        let json = serde_json::to_string(&ControlMessage::RealtimeStatus {
            status: "started".to_string(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "realtime_status");
        assert_eq!(value["status"], "started");

        let json = serde_json::to_string(&ControlMessage::GreetingComplete {
            message: "hello".to_string(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "greeting_complete");
        assert_eq!(value["message"], "hello");
    }

    #[test]
    fn test_ping_without_timestamp() {
        let msg: ControlMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Ping { timestamp: None });

        let json = serde_json::to_string(&ControlMessage::Pong { timestamp: None }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value.get("timestamp").is_none());
    }
}
