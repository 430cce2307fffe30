//! Core type definitions and protocol constants for tether.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Request header carrying the client's registration identity.
pub const CLIENT_ID_HEADER: &str = "Client-ID";

/// Default WebSocket path the relay accepts connections on.
pub const DEFAULT_RELAY_PATH: &str = "/ws";

/// Reserved receiver that asks the relay to fan a message out to every
/// connected client.
pub const BROADCAST: &str = "*";

/// Maximum length of a client identity in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 256;

/// Opaque client identity, unique per live connection on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Wraps a raw identity string without validation.
    ///
    /// Use [`ClientId::parse`] for identities coming off the network.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses a registration identity supplied by a connecting client.
    ///
    /// Rejects empty identities, identities longer than
    /// [`MAX_CLIENT_ID_LEN`], identities containing control characters, and
    /// the reserved [`BROADCAST`] address.
    pub fn parse(raw: &str) -> Result<Self, InvalidClientId> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(InvalidClientId::Empty);
        }
        if id.len() > MAX_CLIENT_ID_LEN {
            return Err(InvalidClientId::TooLong(id.len()));
        }
        if id.chars().any(char::is_control) {
            return Err(InvalidClientId::ControlCharacter);
        }
        if id == BROADCAST {
            return Err(InvalidClientId::Reserved);
        }
        Ok(Self(id.to_string()))
    }

    /// The broadcast pseudo-identity.
    #[must_use]
    pub fn broadcast() -> Self {
        Self(BROADCAST.to_string())
    }

    /// Returns `true` if this is the broadcast pseudo-identity.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST
    }

    /// Borrow the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Reasons a registration identity is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidClientId {
    /// The identity was empty or whitespace.
    #[error("client id is empty")]
    Empty,
    /// The identity exceeded [`MAX_CLIENT_ID_LEN`] bytes.
    #[error("client id too long: {0} bytes")]
    TooLong(usize),
    /// The identity contained a control character.
    #[error("client id contains a control character")]
    ControlCharacter,
    /// The identity was the reserved broadcast address.
    #[error("client id is reserved")]
    Reserved,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_plain_identity() {
        assert_eq!(ClientId::parse("alice").unwrap().as_str(), "alice");
    }

    #[test]
    fn parse_trims_whitespace() {
        assert_eq!(ClientId::parse("  bob \t").unwrap().as_str(), "bob");
    }

    #[test]
    fn parse_rejects_empty() {
        assert_eq!(ClientId::parse(""), Err(InvalidClientId::Empty));
        assert_eq!(ClientId::parse("   "), Err(InvalidClientId::Empty));
    }

    #[test]
    fn parse_rejects_broadcast() {
        assert_eq!(ClientId::parse("*"), Err(InvalidClientId::Reserved));
    }

    #[test]
    fn parse_rejects_control_chars() {
        assert_eq!(
            ClientId::parse("a\u{0}b"),
            Err(InvalidClientId::ControlCharacter)
        );
    }

    #[test]
    fn parse_rejects_overlong() {
        let long = "x".repeat(MAX_CLIENT_ID_LEN + 1);
        assert_eq!(
            ClientId::parse(&long),
            Err(InvalidClientId::TooLong(MAX_CLIENT_ID_LEN + 1))
        );
    }

    #[test]
    fn broadcast_identity_is_recognised() {
        assert!(ClientId::broadcast().is_broadcast());
        assert!(!ClientId::new("alice").is_broadcast());
    }
}
