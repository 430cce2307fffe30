//! Message envelope and its JSON wire codec.
//!
//! An envelope travels as a single WebSocket text frame:
//!
//! ```text
//! {"sender":"alice","receiver":"bob","payload":"aGVsbG8="}
//! ```
//!
//! Keys are emitted in that fixed order and the payload is standard padded
//! base64, so any output of [`Envelope::encode`] re-encodes byte-for-byte
//! after a [`Envelope::decode`].

use crate::types::ClientId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A relayed message: who sent it, who should receive it, and opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    sender: ClientId,
    receiver: ClientId,
    #[serde(with = "base64_payload")]
    payload: Vec<u8>,
}

/// Errors that can occur while encoding or decoding an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The frame was not a well-formed envelope object.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The envelope named no receiver.
    #[error("envelope has an empty receiver")]
    EmptyReceiver,
}

impl Envelope {
    /// Creates a new envelope.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether_common::Envelope;
    /// let env = Envelope::new("alice", "bob", b"hi".to_vec());
    /// assert_eq!(env.sender().as_str(), "alice");
    /// assert_eq!(env.payload(), b"hi");
    /// ```
    #[must_use]
    pub fn new(
        sender: impl Into<ClientId>,
        receiver: impl Into<ClientId>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            payload: payload.into(),
        }
    }

    /// Identity of the client that sent this envelope.
    #[must_use]
    pub const fn sender(&self) -> &ClientId {
        &self.sender
    }

    /// Identity of the client this envelope is addressed to.
    #[must_use]
    pub const fn receiver(&self) -> &ClientId {
        &self.receiver
    }

    /// Raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the envelope, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns `true` if the envelope is addressed to every connected client.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_broadcast()
    }

    /// Returns a copy of this envelope with the sender replaced.
    #[must_use]
    pub fn with_sender(self, sender: ClientId) -> Self {
        Self { sender, ..self }
    }

    /// Returns a copy of this envelope with the receiver replaced.
    #[must_use]
    pub fn with_receiver(self, receiver: ClientId) -> Self {
        Self { receiver, ..self }
    }

    /// Serializes the envelope to its wire text.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses an envelope from wire bytes (text or binary frame contents).
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(data)?;
        if envelope.receiver.as_str().is_empty() {
            return Err(EnvelopeError::EmptyReceiver);
        }
        Ok(envelope)
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_identity() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_.:@-]{1,32}"
    }

    fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..4096)
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            sender in arb_identity(),
            receiver in arb_identity(),
            payload in arb_payload()
        ) {
            let env = Envelope::new(sender, receiver, payload);
            let text = env.encode().unwrap();
            prop_assert_eq!(Envelope::decode(text.as_bytes()).unwrap(), env);
        }

        #[test]
        fn encode_inverts_decode_for_canonical_text(
            sender in arb_identity(),
            receiver in arb_identity(),
            payload in arb_payload()
        ) {
            let text = Envelope::new(sender, receiver, payload).encode().unwrap();
            let reencoded = Envelope::decode(text.as_bytes()).unwrap().encode().unwrap();
            prop_assert_eq!(reencoded, text);
        }

        #[test]
        fn arbitrary_unicode_identities_survive(
            sender in "\\PC{1,16}",
            receiver in "\\PC{1,16}",
            payload in arb_payload()
        ) {
            let env = Envelope::new(sender, receiver, payload);
            let decoded = Envelope::decode(env.encode().unwrap().as_bytes()).unwrap();
            prop_assert_eq!(decoded, env);
        }
    }
}
