//! # Session Coordinator
//!
//! Owns the lifecycle of one conversation session: exactly one client socket,
//! exactly one AI-backend connection, and the turn-taking state machine that
//! bridges them.
//!
//! ## State machine
//! ```text
//! CONNECTING -> ACTIVE -> { TURN_IN_PROGRESS <-> ACTIVE } -> CLOSING -> CLOSED
//! ```
//! - `CONNECTING`: socket accepted, backend handshake still pending. Handshake
//!   success moves to `ACTIVE`; handshake failure goes straight to `CLOSING`
//!   with one descriptive error message to the client.
//! - `ACTIVE`: idle, ready for a turn trigger. A greeting or text prompt opens
//!   a single-shot turn; `start_realtime_voice` opens a continuous turn where
//!   every binary frame is streamed to the backend incrementally.
//! - `TURN_IN_PROGRESS`: inbound forwarding (continuous turns only) and
//!   outbound draining run concurrently. `stop_realtime_voice` or a
//!   backend-reported completion returns to `ACTIVE`.
//! - `CLOSING`/`CLOSED`: terminal teardown, backend connection released.
//!
//! ## Single mutation point
//! Only the coordinator mutates session state. The socket actor and the
//! backend drain task call the entry points below and act on the returned
//! [`Outbound`] frames; they never touch state fields directly. Every entry
//! point is synchronous, which is what makes the whole state machine testable
//! with scripted channels and no sockets.
//!
//! At most one turn is in flight per session. A turn trigger that arrives
//! while one is running is rejected with a status message; a repeated
//! `start_realtime_voice` during its own continuous turn is a no-op that
//! re-sends the acknowledgement.

use crate::audio::codec::{AudioChunk, AudioCodecBridge};
use crate::backend::{BackendCommand, BackendEvent};
use crate::websocket::ControlMessage;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session lifecycle states. Transitions only happen inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    TurnInProgress,
    Closing,
    Closed,
}

/// The two shapes a turn can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    /// One text prompt in, one audio response out, then the turn closes
    SingleShot,
    /// Open-ended audio streaming bounded by start/stop control messages
    Continuous,
}

/// A frame the coordinator wants written to the client socket, in order.
///
/// When a control message and audio belong to the same logical event, the
/// control message comes first in the returned sequence so the client can
/// update UI state before audio starts playing.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Control(ControlMessage),
    Audio(Vec<u8>),
}

/// The per-session state machine and turn bridge.
pub struct SessionCoordinator {
    id: Uuid,
    state: SessionState,
    turn: Option<TurnKind>,
    backend: Option<mpsc::UnboundedSender<BackendCommand>>,
    bridge: AudioCodecBridge,
    /// Prompt text of the current single-shot turn, kept for the textual
    /// fallback when synthesis produces no audio.
    pending_prompt: Option<String>,
    /// Whether the current turn has relayed at least one audio frame.
    turn_audio_relayed: bool,
    created_at: DateTime<Utc>,
    frames_in: u64,
    frames_out: u64,
    chunks_dropped: u64,
}

impl SessionCoordinator {
    pub fn new(bridge: AudioCodecBridge) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Connecting,
            turn: None,
            backend: None,
            bridge,
            pending_prompt: None,
            turn_audio_relayed: false,
            created_at: Utc::now(),
            frames_in: 0,
            frames_out: 0,
            chunks_dropped: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether real-time voice mode is currently on.
    pub fn realtime_voice_active(&self) -> bool {
        self.turn == Some(TurnKind::Continuous)
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped
    }

    /// The backend handshake succeeded; the session is open for turns.
    pub fn backend_ready(&mut self, commands: mpsc::UnboundedSender<BackendCommand>) -> Vec<Outbound> {
        if self.state != SessionState::Connecting {
            warn!(session_id = %self.id, state = ?self.state, "Backend ready in unexpected state");
            return Vec::new();
        }

        self.backend = Some(commands);
        self.state = SessionState::Active;
        info!(session_id = %self.id, "Session active");

        vec![Outbound::Control(ControlMessage::VoiceStatus {
            status: "ready".to_string(),
        })]
    }

    /// The backend handshake failed. Fatal: the session moves to `CLOSING`
    /// and the client gets one descriptive error before the socket closes.
    pub fn backend_failed(&mut self, reason: &str) -> Vec<Outbound> {
        warn!(session_id = %self.id, "Backend handshake failed: {}", reason);
        self.state = SessionState::Closing;
        self.backend = None;

        vec![Outbound::Control(ControlMessage::Error {
            code: "backend_handshake_failure".to_string(),
            message: format!("could not reach the speech backend: {}", reason),
        })]
    }

    /// Handle one parsed control message from the client.
    ///
    /// Unrecognized types and server-to-client types arriving inbound leave
    /// state unchanged.
    pub fn handle_control(&mut self, message: ControlMessage) -> Vec<Outbound> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Vec::new();
        }

        match message {
            ControlMessage::AiGreeting { message } | ControlMessage::UserMessage { message } => {
                self.begin_single_shot_turn(message)
            }
            ControlMessage::StartRealtimeVoice => self.begin_continuous_turn(),
            ControlMessage::StopRealtimeVoice => self.end_continuous_turn(),
            ControlMessage::Ping { timestamp } => {
                vec![Outbound::Control(ControlMessage::Pong { timestamp })]
            }
            ControlMessage::Unknown => {
                debug!(session_id = %self.id, "Ignoring control message with unknown type");
                Vec::new()
            }
            // Server-to-client types have no meaning inbound.
            other => {
                debug!(session_id = %self.id, "Ignoring misdirected control message: {:?}", other);
                Vec::new()
            }
        }
    }

    /// Handle one inbound binary audio frame.
    ///
    /// Explicit guard: no turn in flight (or a single-shot turn, which takes
    /// no streamed audio) means the frame is dropped, never forwarded. Decode
    /// failures drop the chunk and keep the session alive.
    pub fn handle_audio(&mut self, data: Vec<u8>) -> Vec<Outbound> {
        self.frames_in += 1;

        if self.state != SessionState::TurnInProgress || self.turn != Some(TurnKind::Continuous) {
            self.chunks_dropped += 1;
            debug!(
                session_id = %self.id,
                state = ?self.state,
                "Dropping audio frame received outside a continuous turn"
            );
            return Vec::new();
        }

        match self.bridge.transcode_inbound(AudioChunk::container(data)) {
            Ok(converted) => {
                if !converted.is_empty() {
                    self.send_backend(BackendCommand::SendAudio(converted.data));
                }
            }
            Err(e) => {
                self.chunks_dropped += 1;
                warn!(session_id = %self.id, "Dropping undecodable audio chunk: {}", e);
            }
        }

        Vec::new()
    }

    /// Handle one event from the backend's response stream.
    pub fn handle_backend_event(&mut self, event: BackendEvent) -> Vec<Outbound> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Vec::new();
        }

        match event {
            BackendEvent::Audio(bytes) => {
                self.frames_out += 1;
                if self.turn.is_some() {
                    self.turn_audio_relayed = true;
                }
                // Late audio for a turn the client already stopped is still
                // relayed; the utterance belongs to this session either way.
                vec![Outbound::Audio(bytes)]
            }
            BackendEvent::TurnComplete => self.complete_turn(),
            BackendEvent::Closed(reason) => self.backend_stream_closed(&reason),
        }
    }

    /// Begin teardown: release the backend connection and stop accepting
    /// frames. The socket actor calls [`finish_close`](Self::finish_close)
    /// once its own stream is done.
    pub fn begin_close(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }

        if let Some(backend) = self.backend.take() {
            let _ = backend.send(BackendCommand::Close);
        }
        self.turn = None;
        self.state = SessionState::Closing;
        info!(session_id = %self.id, "Session closing");
    }

    /// Terminal transition. The session object is discarded after this.
    pub fn finish_close(&mut self) {
        self.state = SessionState::Closed;
        debug!(session_id = %self.id, "Session closed");
    }

    fn begin_single_shot_turn(&mut self, prompt: String) -> Vec<Outbound> {
        if self.state != SessionState::Active {
            debug!(session_id = %self.id, "Rejecting prompt: turn already in flight");
            return vec![Outbound::Control(ControlMessage::VoiceStatus {
                status: "turn_in_progress".to_string(),
            })];
        }

        self.turn = Some(TurnKind::SingleShot);
        self.turn_audio_relayed = false;
        self.pending_prompt = Some(prompt.clone());
        self.state = SessionState::TurnInProgress;
        self.send_backend(BackendCommand::SendText(prompt));

        vec![Outbound::Control(ControlMessage::VoiceStatus {
            status: "processing".to_string(),
        })]
    }

    fn begin_continuous_turn(&mut self) -> Vec<Outbound> {
        match (self.state, self.turn) {
            (SessionState::Active, None) => {
                self.turn = Some(TurnKind::Continuous);
                self.turn_audio_relayed = false;
                self.state = SessionState::TurnInProgress;
                info!(session_id = %self.id, "Realtime voice started");

                vec![Outbound::Control(ControlMessage::RealtimeStatus {
                    status: "started".to_string(),
                })]
            }
            // A second start during its own continuous turn is a no-op; the
            // acknowledgement is re-sent so the client converges.
            (SessionState::TurnInProgress, Some(TurnKind::Continuous)) => {
                debug!(session_id = %self.id, "Duplicate start_realtime_voice ignored");
                vec![Outbound::Control(ControlMessage::RealtimeStatus {
                    status: "started".to_string(),
                })]
            }
            _ => {
                debug!(session_id = %self.id, "Rejecting start_realtime_voice: turn already in flight");
                vec![Outbound::Control(ControlMessage::VoiceStatus {
                    status: "turn_in_progress".to_string(),
                })]
            }
        }
    }

    fn end_continuous_turn(&mut self) -> Vec<Outbound> {
        if self.turn == Some(TurnKind::Continuous) {
            self.turn = None;
            self.state = SessionState::Active;
            info!(session_id = %self.id, "Realtime voice stopped");
        } else {
            debug!(session_id = %self.id, "stop_realtime_voice with no continuous turn; acking anyway");
        }

        // Idempotent: the stopped ack goes out either way.
        vec![Outbound::Control(ControlMessage::RealtimeStatus {
            status: "stopped".to_string(),
        })]
    }

    fn complete_turn(&mut self) -> Vec<Outbound> {
        let Some(kind) = self.turn.take() else {
            debug!(session_id = %self.id, "Backend turn completion with no turn in flight");
            return Vec::new();
        };

        self.state = SessionState::Active;

        match kind {
            TurnKind::SingleShot if !self.turn_audio_relayed => {
                // Synthesis produced no audio at all; substitute the textual
                // fallback so the client UI does not hang mid-turn.
                let message = self.pending_prompt.take().unwrap_or_default();
                warn!(session_id = %self.id, "Turn completed without audio, sending textual fallback");
                vec![Outbound::Control(ControlMessage::GreetingComplete { message })]
            }
            _ => {
                self.pending_prompt = None;
                vec![Outbound::Control(ControlMessage::AiTurnComplete)]
            }
        }
    }

    fn backend_stream_closed(&mut self, reason: &str) -> Vec<Outbound> {
        self.backend = None;

        let Some(kind) = self.turn.take() else {
            warn!(session_id = %self.id, "Backend stream closed while idle: {}", reason);
            return vec![Outbound::Control(ControlMessage::VoiceStatus {
                status: "backend_disconnected".to_string(),
            })];
        };

        // Mid-turn stream failure aborts the turn, not the session.
        warn!(session_id = %self.id, "Backend stream failed mid-turn: {}", reason);
        self.state = SessionState::Active;

        let mut out = vec![Outbound::Control(ControlMessage::Error {
            code: "backend_stream_failure".to_string(),
            message: format!("the speech backend stopped responding: {}", reason),
        })];

        if kind == TurnKind::SingleShot && !self.turn_audio_relayed {
            let message = self.pending_prompt.take().unwrap_or_default();
            out.push(Outbound::Control(ControlMessage::GreetingComplete { message }));
        }
        self.pending_prompt = None;

        out
    }

    fn send_backend(&mut self, command: BackendCommand) {
        let Some(backend) = &self.backend else {
            warn!(session_id = %self.id, "No backend connection; command dropped");
            return;
        };

        // A failed send means the backend tasks are gone; the Closed event
        // on the drain side handles the state fallout.
        if backend.send(command).is_err() {
            warn!(session_id = %self.id, "Backend command channel closed");
            self.backend = None;
        }
    }
}

/// Cross-session bookkeeping: the only shared resource between sessions is
/// the connection-count limit.
pub struct SessionManager {
    max_concurrent_sessions: usize,
    active: RwLock<HashSet<Uuid>>,
}

impl SessionManager {
    pub fn new(max_concurrent_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            max_concurrent_sessions,
            active: RwLock::new(HashSet::new()),
        })
    }

    /// Register a new session, refusing it when the server is at capacity.
    pub fn try_register(&self, id: Uuid) -> bool {
        let mut active = self.active.write().unwrap();
        if active.len() >= self.max_concurrent_sessions {
            warn!(
                session_id = %id,
                limit = self.max_concurrent_sessions,
                "Session refused: at capacity"
            );
            return false;
        }
        active.insert(id);
        true
    }

    pub fn unregister(&self, id: Uuid) {
        self.active.write().unwrap().remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.active.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav_chunk(samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// A coordinator wired to a scripted backend channel, plus the receiving
    /// end to assert on forwarded commands.
    fn active_session() -> (
        SessionCoordinator,
        mpsc::UnboundedReceiver<BackendCommand>,
    ) {
        let mut coordinator = SessionCoordinator::new(AudioCodecBridge::new(16_000));
        let (tx, rx) = mpsc::unbounded_channel();
        let out = coordinator.backend_ready(tx);

        assert_eq!(coordinator.state(), SessionState::Active);
        assert_eq!(
            out,
            vec![Outbound::Control(ControlMessage::VoiceStatus {
                status: "ready".to_string()
            })]
        );
        (coordinator, rx)
    }

    #[test]
    fn test_scenario_greeting_turn_completes() {
        let (mut session, mut backend_rx) = active_session();

        let out = session.handle_control(ControlMessage::AiGreeting {
            message: "hi".to_string(),
        });
        assert_eq!(session.state(), SessionState::TurnInProgress);
        assert_eq!(
            out,
            vec![Outbound::Control(ControlMessage::VoiceStatus {
                status: "processing".to_string()
            })]
        );
        assert_eq!(
            backend_rx.try_recv().unwrap(),
            BackendCommand::SendText("hi".to_string())
        );

        let audio = session.handle_backend_event(BackendEvent::Audio(vec![1, 2, 3, 4]));
        assert_eq!(audio, vec![Outbound::Audio(vec![1, 2, 3, 4])]);

        let done = session.handle_backend_event(BackendEvent::TurnComplete);
        assert_eq!(done, vec![Outbound::Control(ControlMessage::AiTurnComplete)]);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_greeting_without_audio_falls_back_to_text() {
        let (mut session, _backend_rx) = active_session();

        session.handle_control(ControlMessage::AiGreeting {
            message: "welcome aboard".to_string(),
        });

        // The backend finishes the turn without ever sending audio.
        let done = session.handle_backend_event(BackendEvent::TurnComplete);
        assert_eq!(
            done,
            vec![Outbound::Control(ControlMessage::GreetingComplete {
                message: "welcome aboard".to_string()
            })]
        );
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_scenario_realtime_voice_forwards_in_order() {
        let (mut session, mut backend_rx) = active_session();

        let out = session.handle_control(ControlMessage::StartRealtimeVoice);
        assert_eq!(session.state(), SessionState::TurnInProgress);
        assert!(session.realtime_voice_active());
        assert_eq!(
            out,
            vec![Outbound::Control(ControlMessage::RealtimeStatus {
                status: "started".to_string()
            })]
        );

        let chunks = [
            wav_chunk(&[100i16; 160]),
            wav_chunk(&[200i16; 160]),
            wav_chunk(&[300i16; 160]),
        ];
        for chunk in &chunks {
            session.handle_audio(chunk.clone());
        }

        // Each chunk is forwarded after decode, in receipt order.
        let mut forwarded = Vec::new();
        while let Ok(cmd) = backend_rx.try_recv() {
            match cmd {
                BackendCommand::SendAudio(pcm) => forwarded.push(pcm),
                other => panic!("unexpected command: {:?}", other),
            }
        }
        assert_eq!(forwarded.len(), 3);
        for (i, pcm) in forwarded.iter().enumerate() {
            let samples = crate::audio::codec::parse_pcm16le(pcm).unwrap();
            let expected = [100i16, 200, 300][i];
            assert!(samples.iter().all(|&s| (s - expected).abs() <= 1));
        }

        // Stop ends the turn regardless of whether the backend replied.
        let out = session.handle_control(ControlMessage::StopRealtimeVoice);
        assert_eq!(session.state(), SessionState::Active);
        assert!(!session.realtime_voice_active());
        assert_eq!(
            out,
            vec![Outbound::Control(ControlMessage::RealtimeStatus {
                status: "stopped".to_string()
            })]
        );
    }

    #[test]
    fn test_scenario_handshake_failure_is_fatal() {
        let mut session = SessionCoordinator::new(AudioCodecBridge::new(16_000));
        assert_eq!(session.state(), SessionState::Connecting);

        let out = session.backend_failed("connection refused");
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outbound::Control(ControlMessage::Error { code, message }) => {
                assert_eq!(code, "backend_handshake_failure");
                assert!(message.contains("connection refused"));
            }
            other => panic!("expected error control message, got {:?}", other),
        }

        session.finish_close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_unknown_control_type_leaves_state_unchanged() {
        let (mut session, _backend_rx) = active_session();
        session.handle_control(ControlMessage::StartRealtimeVoice);

        let out = session.handle_control(ControlMessage::Unknown);
        assert!(out.is_empty());
        assert_eq!(session.state(), SessionState::TurnInProgress);
        assert!(session.realtime_voice_active());
    }

    #[test]
    fn test_audio_without_turn_is_never_forwarded() {
        let (mut session, mut backend_rx) = active_session();

        session.handle_audio(wav_chunk(&[500i16; 160]));

        assert!(backend_rx.try_recv().is_err());
        assert_eq!(session.chunks_dropped(), 1);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_undecodable_chunk_drops_but_session_survives() {
        let (mut session, mut backend_rx) = active_session();
        session.handle_control(ControlMessage::StartRealtimeVoice);

        session.handle_audio(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(backend_rx.try_recv().is_err());
        assert_eq!(session.chunks_dropped(), 1);
        assert_eq!(session.state(), SessionState::TurnInProgress);

        // A good chunk right after still goes through.
        session.handle_audio(wav_chunk(&[100i16; 160]));
        assert!(matches!(
            backend_rx.try_recv().unwrap(),
            BackendCommand::SendAudio(_)
        ));
    }

    #[test]
    fn test_duplicate_start_is_noop_with_ack() {
        let (mut session, _backend_rx) = active_session();

        session.handle_control(ControlMessage::StartRealtimeVoice);
        let out = session.handle_control(ControlMessage::StartRealtimeVoice);

        assert_eq!(session.state(), SessionState::TurnInProgress);
        assert_eq!(
            out,
            vec![Outbound::Control(ControlMessage::RealtimeStatus {
                status: "started".to_string()
            })]
        );
    }

    #[test]
    fn test_prompt_during_turn_is_rejected() {
        let (mut session, mut backend_rx) = active_session();

        session.handle_control(ControlMessage::StartRealtimeVoice);
        let out = session.handle_control(ControlMessage::UserMessage {
            message: "interrupting".to_string(),
        });

        assert_eq!(
            out,
            vec![Outbound::Control(ControlMessage::VoiceStatus {
                status: "turn_in_progress".to_string()
            })]
        );
        // The prompt never reached the backend.
        assert!(backend_rx.try_recv().is_err());
        assert!(session.realtime_voice_active());
    }

    #[test]
    fn test_backend_stream_failure_mid_turn_returns_to_active() {
        let (mut session, _backend_rx) = active_session();
        session.handle_control(ControlMessage::StartRealtimeVoice);

        let out = session.handle_backend_event(BackendEvent::Closed("reset by peer".to_string()));

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outbound::Control(ControlMessage::Error { code, .. }) => {
                assert_eq!(code, "backend_stream_failure");
            }
            other => panic!("expected error control message, got {:?}", other),
        }
    }

    #[test]
    fn test_single_shot_stream_failure_includes_fallback() {
        let (mut session, _backend_rx) = active_session();
        session.handle_control(ControlMessage::AiGreeting {
            message: "hello there".to_string(),
        });

        let out = session.handle_backend_event(BackendEvent::Closed("gone".to_string()));

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0],
            Outbound::Control(ControlMessage::Error { .. })
        ));
        assert_eq!(
            out[1],
            Outbound::Control(ControlMessage::GreetingComplete {
                message: "hello there".to_string()
            })
        );
    }

    #[test]
    fn test_close_releases_backend() {
        let (mut session, mut backend_rx) = active_session();
        session.handle_control(ControlMessage::StartRealtimeVoice);

        session.begin_close();
        assert_eq!(session.state(), SessionState::Closing);

        // Drain the start-side traffic, then the cooperative close.
        let mut saw_close = false;
        while let Ok(cmd) = backend_rx.try_recv() {
            if cmd == BackendCommand::Close {
                saw_close = true;
            }
        }
        assert!(saw_close);

        // Nothing gets through after closing begins.
        assert!(session.handle_control(ControlMessage::StartRealtimeVoice).is_empty());
        assert!(session
            .handle_backend_event(BackendEvent::Audio(vec![1, 2]))
            .is_empty());
    }

    #[test]
    fn test_session_manager_capacity() {
        let manager = SessionManager::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        assert!(manager.try_register(a));
        assert!(manager.try_register(b));
        assert!(!manager.try_register(c));
        assert_eq!(manager.active_count(), 2);

        manager.unregister(a);
        assert!(manager.try_register(c));
    }
}
