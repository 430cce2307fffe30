//! Failure taxonomy shared by the relay server and client.

use std::fmt;

/// Coarse classification of relay failures.
///
/// Crate-specific error enums map onto this through their `kind()` methods so
/// hooks and metrics can report failures without depending on transport
/// error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport-level accept/connect failure; the connection never registered.
    HandshakeFailed,
    /// Relay target is not currently registered.
    ReceiverNotFound,
    /// Writing to a registered connection failed; the receiver was evicted.
    SendFailed,
    /// The receive loop ended on a transport or codec error.
    ReadFailed,
    /// Nothing was received within the idle-read deadline.
    IdleTimeout,
    /// The client exhausted its reconnect attempts.
    MaxRetriesExceeded,
}

impl ErrorKind {
    /// Stable lowercase label, used for log fields and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeFailed => "handshake_failed",
            Self::ReceiverNotFound => "receiver_not_found",
            Self::SendFailed => "send_failed",
            Self::ReadFailed => "read_failed",
            Self::IdleTimeout => "idle_timeout",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_snake_case() {
        for kind in [
            ErrorKind::HandshakeFailed,
            ErrorKind::ReceiverNotFound,
            ErrorKind::SendFailed,
            ErrorKind::ReadFailed,
            ErrorKind::IdleTimeout,
            ErrorKind::MaxRetriesExceeded,
        ] {
            let label = kind.as_str();
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
            assert_eq!(kind.to_string(), label);
        }
    }
}
