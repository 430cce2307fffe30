//! tether client: a persistent relay connection that reconnects at a fixed
//! interval and gives up after a bounded run of failures.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Fixed-interval retry schedule.
pub mod backoff;
/// CLI parsing and layered configuration.
pub mod config;
/// Transport seam between the engine and the network.
pub mod connector;
/// Reconnect engine: supervisor task, send path and receive dispatch.
pub mod engine;
/// Client error type.
pub mod error;

pub use connector::{Connector, WsConnector};
pub use engine::{EngineConfig, EngineState, ReconnectEngine};
pub use error::EngineError;
