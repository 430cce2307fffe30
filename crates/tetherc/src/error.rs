use tether_common::types::InvalidClientId;
use tether_common::ErrorKind;

/// Errors surfaced by the reconnect engine and its connector.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `start` was called twice.
    #[error("engine already started")]
    AlreadyStarted,

    /// `start` was called after `stop`.
    #[error("engine has been stopped")]
    Stopped,

    /// `finished` was awaited before `start`.
    #[error("engine was never started")]
    NotStarted,

    /// The run of consecutive failures reached the retry budget.
    #[error("gave up after {attempts} consecutive failed attempts")]
    MaxRetriesExceeded {
        /// Length of the failed run.
        attempts: u32,
    },

    /// The registration identity is empty, too long or reserved.
    #[error("invalid client identity: {0}")]
    InvalidIdentity(#[from] InvalidClientId),

    /// The identity is valid but not a legal HTTP header value.
    #[error("client identity cannot be sent as a header: {0}")]
    InvalidHeader(String),

    /// The server URL could not be turned into a WebSocket request.
    #[error("invalid server url: {0}")]
    InvalidUrl(#[source] tungstenite::Error),

    /// A connection attempt failed before registration.
    #[error("connect failed: {0}")]
    Connect(#[source] tungstenite::Error),

    /// The relay went away without a Close frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// Nothing was received within the idle-read deadline.
    #[error("no traffic within the idle timeout")]
    IdleTimeout,

    /// WebSocket transport error while reading from the relay.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Writing a frame to the relay failed.
    #[error("write failed: {0}")]
    Write(#[source] tungstenite::Error),

    /// The relay stopped draining its socket and a write did not finish
    /// within the idle timeout.
    #[error("write timed out")]
    WriteTimeout,
}

impl EngineError {
    /// Shared failure category, if this error maps onto one.
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Connect(_) => Some(ErrorKind::HandshakeFailed),
            Self::MaxRetriesExceeded { .. } => Some(ErrorKind::MaxRetriesExceeded),
            Self::ConnectionClosed | Self::WebSocket(_) => Some(ErrorKind::ReadFailed),
            Self::IdleTimeout => Some(ErrorKind::IdleTimeout),
            Self::Write(_) | Self::WriteTimeout => Some(ErrorKind::SendFailed),
            Self::AlreadyStarted
            | Self::Stopped
            | Self::NotStarted
            | Self::InvalidIdentity(_)
            | Self::InvalidHeader(_)
            | Self::InvalidUrl(_) => None,
        }
    }
}
