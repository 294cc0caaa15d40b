//! # Error Handling
//!
//! Two error families live here:
//!
//! - **AppError**: errors surfaced by the HTTP endpoints (health, config).
//!   Implements actix's `ResponseError` so handlers can return them directly.
//! - **RelayError**: everything that can go wrong on the voice relay path —
//!   malformed control frames, undecodable audio, backend failures, socket
//!   disconnects. These never become HTTP responses; they are logged and,
//!   where the protocol requires it, reported to the client as an `error`
//!   control frame.
//!
//! ## Recovery policy:
//! A single bad chunk or control message must never terminate a session.
//! Only two relay errors are fatal for a session: a failed backend handshake
//! and a transport-level socket disconnect. `RelayError::is_fatal` encodes
//! exactly that split so callers don't re-derive it.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by the HTTP API surface.
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (lock poisoning, unexpected state)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts `AppError` into the JSON error envelope all endpoints share:
///
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Server port cannot be 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

/// Errors on the voice relay path.
///
/// ## Taxonomy:
/// - **MalformedControlMessage**: a text frame that is not valid JSON.
///   Recovered — the frame is dropped and logged.
/// - **AudioDecodeFailure**: an inbound chunk the codec bridge could not
///   decode. Recovered — the chunk is dropped and logged.
/// - **BackendHandshakeFailure**: the AI backend connection never became
///   usable. Fatal — the session closes after notifying the client.
/// - **BackendStreamFailure**: the backend erred or vanished mid-turn.
///   Recovered — the turn is aborted, the client is notified and the
///   session returns to active.
/// - **SocketDisconnect**: the client socket went away. Fatal — the session
///   is torn down and both forwarding tasks are cancelled.
#[derive(Debug)]
pub enum RelayError {
    MalformedControlMessage(String),
    AudioDecodeFailure(String),
    BackendHandshakeFailure(String),
    BackendStreamFailure(String),
    SocketDisconnect(String),
}

impl RelayError {
    /// Whether this error terminates the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::BackendHandshakeFailure(_) | RelayError::SocketDisconnect(_)
        )
    }

    /// Machine-readable code used in `error` control frames.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::MalformedControlMessage(_) => "malformed_control_message",
            RelayError::AudioDecodeFailure(_) => "audio_decode_failure",
            RelayError::BackendHandshakeFailure(_) => "backend_handshake_failure",
            RelayError::BackendStreamFailure(_) => "backend_stream_failure",
            RelayError::SocketDisconnect(_) => "socket_disconnect",
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::MalformedControlMessage(msg) => {
                write!(f, "Malformed control message: {}", msg)
            }
            RelayError::AudioDecodeFailure(msg) => write!(f, "Audio decode failure: {}", msg),
            RelayError::BackendHandshakeFailure(msg) => {
                write!(f, "Backend handshake failure: {}", msg)
            }
            RelayError::BackendStreamFailure(msg) => write!(f, "Backend stream failure: {}", msg),
            RelayError::SocketDisconnect(msg) => write!(f, "Socket disconnect: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::BackendStreamFailure(err.to_string())
    }
}

/// Type alias for Results on the relay path.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RelayError::BackendHandshakeFailure("refused".into()).is_fatal());
        assert!(RelayError::SocketDisconnect("gone".into()).is_fatal());
        assert!(!RelayError::MalformedControlMessage("not json".into()).is_fatal());
        assert!(!RelayError::AudioDecodeFailure("bad container".into()).is_fatal());
        assert!(!RelayError::BackendStreamFailure("mid-turn".into()).is_fatal());
    }

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(
            RelayError::AudioDecodeFailure(String::new()).code(),
            "audio_decode_failure"
        );
        assert_eq!(
            RelayError::BackendHandshakeFailure(String::new()).code(),
            "backend_handshake_failure"
        );
    }
}
