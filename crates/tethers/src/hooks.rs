use tether_common::{ClientId, ErrorKind};

/// Observer notified of connection lifecycle events.
///
/// Callbacks run on the connection's task and must not block.
pub trait ConnectionHooks: Send + Sync {
    /// A client completed the handshake and was registered.
    fn on_connect(&self, _client: &ClientId) {}

    /// A registered client was torn down. `error` is `None` for a clean
    /// close. Called exactly once per registered connection.
    fn on_disconnect(&self, _client: &ClientId, _error: Option<ErrorKind>) {}

    /// A client sent an envelope; called before it is relayed.
    fn on_receive(&self, _client: &ClientId, _payload: &[u8]) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ConnectionHooks for NoopHooks {}

/// Hooks that log every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl ConnectionHooks for LoggingHooks {
    fn on_connect(&self, client: &ClientId) {
        tracing::info!(client = %client, "client connected");
    }

    fn on_disconnect(&self, client: &ClientId, error: Option<ErrorKind>) {
        match error {
            Some(kind) => tracing::info!(client = %client, error = %kind, "client disconnected"),
            None => tracing::info!(client = %client, "client disconnected"),
        }
    }

    fn on_receive(&self, client: &ClientId, payload: &[u8]) {
        tracing::debug!(
            client = %client,
            bytes = payload.len(),
            "received message"
        );
    }
}
