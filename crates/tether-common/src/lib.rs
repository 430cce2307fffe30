//! Shared building blocks for the tether message relay.
//!
//! This crate provides:
//! - The message envelope and its JSON wire codec ([`envelope`])
//! - Client identities and protocol constants ([`types`])
//! - The failure taxonomy shared by server and client ([`error`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod types;

pub use envelope::{Envelope, EnvelopeError};
pub use error::ErrorKind;
pub use types::ClientId;
