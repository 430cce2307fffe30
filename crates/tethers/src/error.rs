use tether_common::{ClientId, EnvelopeError, ErrorKind};
use thiserror::Error;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum ServerError {
    /// `run` was called on a server that is already running or has run.
    #[error("server already started")]
    AlreadyStarted,
    /// The WebSocket upgrade was refused or failed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),
    /// The client did not finish the upgrade in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// WebSocket transport error after registration.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Writing a frame to the client failed.
    #[error("write failed: {0}")]
    Write(#[source] tungstenite::Error),
    /// The client stopped draining its socket and a write did not finish in
    /// time.
    #[error("write timed out")]
    WriteTimeout,
    /// The client sent a frame that is not a valid envelope.
    #[error("invalid envelope: {0}")]
    Envelope(#[from] EnvelopeError),
    /// Nothing was received within the idle-read deadline.
    #[error("idle timeout")]
    IdleTimeout,
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Classify this error for hooks and metrics.
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Handshake(_) | Self::HandshakeTimeout => Some(ErrorKind::HandshakeFailed),
            Self::WebSocket(_) | Self::Envelope(_) | Self::Io(_) => Some(ErrorKind::ReadFailed),
            Self::Write(_) | Self::WriteTimeout => Some(ErrorKind::SendFailed),
            Self::IdleTimeout => Some(ErrorKind::IdleTimeout),
            Self::AlreadyStarted => None,
        }
    }
}

/// Why a relay attempt did not reach its receiver.
#[derive(Error, Debug)]
pub enum RouteError {
    /// No connection is registered under the receiver identity.
    #[error("receiver not found: {0}")]
    ReceiverNotFound(ClientId),
    /// The receiver's queue refused the frame; the receiver was evicted.
    #[error("send to {0} failed")]
    SendFailed(ClientId),
    /// The envelope could not be re-encoded for delivery.
    #[error("encode failed: {0}")]
    Encode(#[from] EnvelopeError),
}

impl RouteError {
    /// Classify this error for hooks and metrics.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ReceiverNotFound(_) => ErrorKind::ReceiverNotFound,
            Self::SendFailed(_) | Self::Encode(_) => ErrorKind::SendFailed,
        }
    }
}
