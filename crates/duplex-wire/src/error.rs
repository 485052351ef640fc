//! Error types for the duplex wire layer.
//!
//! [`WireError`] is what fallible operations return. [`ProtocolError`] is the
//! configuration error raised by [`ProtocolBuilder::build`](crate::protocol::ProtocolBuilder::build).
//! [`DispatchError`] describes a single message that could not be processed; it
//! is reported through the orchestrator's `MessageError` event and never tears
//! down the channel.

use crate::frame::Dispatch;
use crate::handshake::HandshakeOutcome;
use crate::policy::PolicyViolation;
use thiserror::Error;

/// Error returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Which side of the handshake produced a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionOrigin {
    /// Our own callback returned a non-accepted outcome.
    Local,
    /// The peer reported a non-accepted outcome.
    Remote,
}

impl std::fmt::Display for RejectionOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("Invalid state '{current}' for operation '{operation}'")]
    InvalidState {
        current: String,
        operation: &'static str,
    },
    #[error("Handshake rejected ({origin}): {outcome}")]
    HandshakeRejected {
        outcome: HandshakeOutcome,
        origin: RejectionOrigin,
    },
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Orchestrator is not ready to send ordinary messages")]
    NotReady,
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("No serializer registered for message type '{0}'")]
    MissingSerializer(String),
    #[error("Message does not match the type registered for '{0}'")]
    TypeMismatch(String),
    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyViolation),
    #[error("Protocol definition error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Configuration errors detected eagerly when a protocol is built.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("No handshake declared")]
    MissingHandshake,
    #[error("More than one handshake declared")]
    DuplicateHandshake,
    #[error("Handshake declaration is missing its '{0}' callback")]
    IncompleteHandshake(&'static str),
    #[error("Message type '{tag}' is referenced by {referenced_by} but has no serializer")]
    MissingSerializer {
        tag: String,
        referenced_by: &'static str,
    },
    #[error("Message type '{0}' has more than one serializer")]
    DuplicateSerializer(String),
    #[error("Duplicate {section} handler for '{tag}'")]
    DuplicateHandler { section: &'static str, tag: String },
    #[error("Tag '{0}' is used by two different Rust types")]
    TagConflict(String),
    #[error("Authenticated handshake requires a non-empty shared secret")]
    EmptySharedSecret,
}

/// Why a single inbound or outbound message could not be processed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Failed to decode frame: {0}")]
    Decode(String),
    #[error("No {dispatch} handler for '{tag}'")]
    Unhandled { tag: String, dispatch: Dispatch },
    #[error("Handler for '{tag}' failed: {reason}")]
    Handler { tag: String, reason: String },
    #[error("Handler for '{tag}' panicked")]
    Panicked { tag: String },
    #[error("Response '{tag}' (correlation {correlation}) matches no pending request")]
    UnsolicitedResponse { tag: String, correlation: u64 },
    #[error("Failed to serialize '{tag}': {reason}")]
    Serialize { tag: String, reason: String },
    #[error("Transport refused '{tag}'")]
    SendFailed { tag: String },
    #[error("Handshake message '{tag}' received after the handshake completed")]
    UnexpectedHandshake { tag: String },
    #[error("Request '{tag}' (correlation {correlation}) evicted before its response arrived")]
    RequestEvicted { tag: String, correlation: u64 },
}

