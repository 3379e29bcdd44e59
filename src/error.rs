//! Error taxonomy shared by all layers.
//!
//! | Kind | Raised by | Handling |
//! |------|-----------|----------|
//! | [`TransportError`] | carriers, listener | retried with backoff, then surfaced |
//! | [`HandshakeError`] | secure channel | connection dropped, not retried |
//! | [`ProtocolError`] | framing, mux, AEAD | connection dropped, peer penalized |
//! | [`ApplicationError`] | node API | returned to the caller, no side effect |

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::identity::Identity;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer unreachable at {addr}: {reason}")]
    Unreachable { addr: String, reason: String },
    #[error("operation timed out")]
    Timeout,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("no configured carrier can dial {0}")]
    UnsupportedAddress(String),
    #[error("relay refused circuit: {0}")]
    RelayRefused(String),
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake timed out")]
    Timeout,
    #[error("unsupported handshake version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed handshake message: {0}")]
    Malformed(&'static str),
    #[error("handshake payload failed authentication")]
    Decrypt,
    #[error("identity signature over the session transcript is invalid")]
    BadSignature,
    #[error("remote identity key is not a valid Ed25519 point")]
    InvalidKey,
    #[error("key exchange produced a non-contributory shared secret")]
    WeakKey,
    #[error("expected peer {expected} but authenticated {actual}")]
    IdentityMismatch { expected: Identity, actual: Identity },
    #[error("connection closed during handshake")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed varint")]
    MalformedVarint,
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("failed to decode frame payload: {0}")]
    Decode(String),
    #[error("frame failed authentication")]
    Decrypt,
    #[error("nonce counter exhausted")]
    NonceExhausted,
    #[error("stream {stream} exceeded its receive window")]
    FlowControl { stream: u64 },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("stream is closed for writing")]
    StreamClosed,
    #[error("stream was reset by the peer")]
    StreamReset,
    #[error("stream limit of {0} reached")]
    TooManyStreams(usize),
    #[error("operation timed out")]
    Timeout,
    #[error("protocol i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("node is not started")]
    NotStarted,
    #[error("node is already running")]
    AlreadyRunning,
    #[error("not subscribed to topic {0:?}")]
    NotSubscribed(String),
    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: &'static str },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },
    #[error("invalid setting {field}: {reason}")]
    InvalidValue { field: &'static str, reason: &'static str },
}

/// Top-level error returned by [`crate::Node`].
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl NodeError {
    /// The application-level cause, if this is one.
    pub fn application(&self) -> Option<&ApplicationError> {
        match self {
            NodeError::Application(e) => Some(e),
            _ => None,
        }
    }
}
