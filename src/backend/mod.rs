//! # AI Speech Backend Connection
//!
//! The AI backend is an external collaborator: a bidirectional streaming
//! WebSocket that accepts either a text prompt or a sequence of raw-PCM
//! chunks, and emits response events carrying synthesized speech audio and a
//! turn-completion marker. It may be slow, error mid-stream, or close
//! unexpectedly; nothing here panics on its behalf.
//!
//! The seam between the relay and the wire is a pair of ordered channels
//! ([`BackendConnection`]). The session coordinator only ever sees
//! [`BackendCommand`] going out and [`BackendEvent`] coming in — tests drive
//! it with scripted channels and no network at all. Each connection is owned
//! exclusively by one session and torn down with it.

pub mod live;

use tokio::sync::mpsc;

pub use live::LiveBackendClient;

/// Commands the relay sends to the backend connection tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCommand {
    /// One complete text prompt (single-shot turn)
    SendText(String),
    /// One chunk of raw 16-bit PCM at the backend's input rate
    SendAudio(Vec<u8>),
    /// Cooperative shutdown: finish the current write, close the stream
    Close,
}

/// Events the backend connection tasks surface to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Synthesized speech bytes, forwarded to the client unchanged
    Audio(Vec<u8>),
    /// The backend finished its utterance for the current turn
    TurnComplete,
    /// The stream ended — normally or otherwise. Terminal.
    Closed(String),
}

/// The channel pair a live (or scripted) backend connection hands to a
/// session.
///
/// Both channels preserve order, which is what guarantees audio chunks of
/// one turn reach the backend in receipt order.
pub struct BackendConnection {
    pub commands: mpsc::UnboundedSender<BackendCommand>,
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
}

impl BackendConnection {
    /// Assemble a connection from raw channel halves. Production code gets
    /// one from [`LiveBackendClient::connect`]; tests script their own.
    pub fn from_parts(
        commands: mpsc::UnboundedSender<BackendCommand>,
        events: mpsc::UnboundedReceiver<BackendEvent>,
    ) -> Self {
        Self { commands, events }
    }
}
