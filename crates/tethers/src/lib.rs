//! tether relay server: routes JSON envelopes between WebSocket clients keyed
//! by the identity each client registers with.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
/// Per-connection handshake, receive loop and teardown.
pub mod connection;
/// Error types for relay server operations.
pub mod error;
/// Lifecycle callbacks.
pub mod hooks;
/// Exit-when-empty policy.
pub mod idle;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Identity-keyed table of live connections.
pub mod registry;
/// Point-to-point relay and broadcast.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use error::{RouteError, ServerError};
pub use hooks::{ConnectionHooks, LoggingHooks, NoopHooks};
pub use server::{Server, ServerExit, ServerState};
