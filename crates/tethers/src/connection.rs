use crate::error::ServerError;
use crate::metrics::{counters, gauges, histograms};
use crate::registry::{Admission, CloseCause, ConnHandle, Mailbox};
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::pending;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tether_common::types::CLIENT_ID_HEADER;
use tether_common::{ClientId, Envelope, ErrorKind};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle phase of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// WebSocket upgrade in progress.
    Connecting,
    /// Inserted into the registry.
    Registered,
    /// Receive loop, keepalive and outbound writer running.
    Active,
    /// Teardown started.
    Closing,
    /// Deregistered and transport closed.
    Closed,
}

impl ConnState {
    /// Returns `true` if a connection may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Registered | Self::Closed)
                | (Self::Registered, Self::Active | Self::Closing)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// How the receive loop ended when it ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    PeerClosed,
    Forced(CloseCause),
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Check the upgrade request's path and extract its registration identity.
fn authorize(request: &Request, path: &str) -> Result<ClientId, ErrorResponse> {
    if request.uri().path() != path {
        return Err(reject(StatusCode::NOT_FOUND, "unknown path"));
    }
    let raw = request
        .headers()
        .get(CLIENT_ID_HEADER)
        .ok_or_else(|| reject(StatusCode::BAD_REQUEST, "missing Client-ID header"))?
        .to_str()
        .map_err(|_| reject(StatusCode::BAD_REQUEST, "Client-ID header is not valid text"))?;
    ClientId::parse(raw)
        .map_err(|e| reject(StatusCode::BAD_REQUEST, &format!("invalid Client-ID: {e}")))
}

/// Perform the WebSocket upgrade and return the stream with the identity
/// the client registered under.
async fn accept(
    stream: TcpStream,
    state: &ServerState,
) -> Result<(WebSocketStream<TcpStream>, ClientId), ServerError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message_size),
        max_frame_size: Some(state.config.max_message_size),
        ..WebSocketConfig::default()
    };

    let identity = Arc::new(OnceLock::new());
    let identity_cell = Arc::clone(&identity);
    let path = state.config.path.clone();
    let handshake = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let client = authorize(req, &path)?;
            let _ = identity_cell.set(client);
            Ok(resp)
        },
        Some(ws_config),
    );

    let ws_stream = match timeout(state.config.handshake_timeout, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            counters::handshakes_total("rejected");
            return Err(ServerError::Handshake(e));
        }
        Err(_) => {
            counters::handshakes_total("timeout");
            return Err(ServerError::HandshakeTimeout);
        }
    };

    let client = identity.get().cloned().ok_or_else(|| {
        ServerError::Handshake(tungstenite::Error::Protocol(
            ProtocolError::HandshakeIncomplete,
        ))
    })?;
    counters::handshakes_total("accepted");
    Ok((ws_stream, client))
}

/// Registration and teardown of one connection.
///
/// Teardown runs at most once: either from [`Lifecycle::close`] or, if the
/// task is cancelled first, from `Drop`.
struct Lifecycle {
    state: Arc<ServerState>,
    handle: ConnHandle,
    phase: ConnState,
    torn_down: AtomicBool,
}

impl Lifecycle {
    fn register(state: Arc<ServerState>, handle: ConnHandle, peer_addr: SocketAddr) -> Self {
        let mut lifecycle = Self {
            state,
            handle,
            phase: ConnState::Connecting,
            torn_down: AtomicBool::new(false),
        };
        let client = lifecycle.handle.client().clone();

        if let Some(previous) = lifecycle.state.registry().register(lifecycle.handle.clone()) {
            tracing::info!(
                client = %client,
                conn_id = lifecycle.handle.id().get(),
                replaced = previous.id().get(),
                "identity re-registered, closing previous connection"
            );
        }
        if lifecycle.state.is_shutting_down() {
            lifecycle.handle.close(CloseCause::Shutdown);
        }
        gauges::inc_connections_active();
        lifecycle.transition(ConnState::Registered);
        tracing::debug!(
            client = %client,
            conn_id = lifecycle.handle.id().get(),
            peer = %peer_addr,
            "connection registered"
        );

        lifecycle.state.hooks.on_connect(&client);
        lifecycle.transition(ConnState::Active);
        lifecycle
    }

    fn transition(&mut self, next: ConnState) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid connection transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    /// Remove this connection from the registry. Returns `false` if teardown
    /// already ran.
    fn deregister(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state
            .registry()
            .remove_if(self.handle.client(), self.handle.id());
        gauges::dec_connections_active();
        true
    }

    async fn close(&mut self, ws_tx: &mut WsSink, error: Option<ErrorKind>) {
        self.transition(ConnState::Closing);
        if !self.deregister() {
            return;
        }
        if timeout(CLOSE_TIMEOUT, ws_tx.close()).await.is_err() {
            tracing::debug!(client = %self.handle.client(), "close handshake timed out");
        }
        self.state.hooks.on_disconnect(self.handle.client(), error);
        self.transition(ConnState::Closed);
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if self.deregister() {
            self.state
                .hooks
                .on_disconnect(self.handle.client(), Some(ErrorKind::ReadFailed));
        }
    }
}

async fn closed(close: &mut watch::Receiver<Option<CloseCause>>) -> CloseCause {
    let cause = close.wait_for(Option::is_some).await.map(|c| *c);
    match cause {
        Ok(Some(cause)) => cause,
        _ => pending().await,
    }
}

/// Write one frame, giving up once `limit` passes. A peer that stops reading
/// would otherwise park the loop on a full socket buffer.
async fn write_frame(ws_tx: &mut WsSink, msg: Message, limit: Duration) -> Result<(), ServerError> {
    match timeout(limit, ws_tx.send(msg)).await {
        Ok(result) => result.map_err(ServerError::Write),
        Err(_) => Err(ServerError::WriteTimeout),
    }
}

/// Drive the receive loop, keepalive and outbound writer for a registered
/// connection.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    mailbox: Mailbox,
    state: &ServerState,
    client: &ClientId,
) -> Result<Ended, ServerError> {
    let Mailbox {
        mut outbound,
        mut close,
    } = mailbox;
    let idle_timeout = state.config.idle_timeout;
    let ping_period = state.config.ping_interval;
    let mut ping_interval = interval_at(Instant::now() + ping_period, ping_period);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                idle.as_mut().reset(Instant::now() + idle_timeout);
                match msg {
                    Some(Ok(Message::Text(text))) => process_frame(text.as_bytes(), state, client)?,
                    Some(Ok(Message::Binary(data))) => process_frame(&data, state, client)?,
                    Some(Ok(Message::Ping(data))) => {
                        write_frame(ws_tx, Message::Pong(data), idle_timeout).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        tracing::trace!(client = %client, "pong received");
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(Ended::PeerClosed),
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return Err(ServerError::WebSocket(e)),
                }
            }
            Some(frame) = outbound.recv() => {
                counters::payload_bytes_total("out", frame.len() as u64);
                write_frame(ws_tx, Message::Text(frame), idle_timeout).await?;
            }
            _ = ping_interval.tick() => {
                write_frame(ws_tx, Message::Ping(Vec::new()), idle_timeout).await?;
            }
            () = &mut idle => {
                tracing::debug!(client = %client, "idle timeout reached, closing connection");
                return Err(ServerError::IdleTimeout);
            }
            cause = closed(&mut close) => return Ok(Ended::Forced(cause)),
        }
    }
}

/// Decode an inbound frame, stamp its sender, notify hooks and relay it.
/// Routing failures are logged, never reported to the sender.
fn process_frame(data: &[u8], state: &ServerState, client: &ClientId) -> Result<(), ServerError> {
    let start = Instant::now();
    counters::payload_bytes_total("in", data.len() as u64);

    let mut envelope = Envelope::decode(data)?;
    if envelope.sender() != client {
        tracing::warn!(
            client = %client,
            claimed = %envelope.sender(),
            "envelope sender does not match registered identity, overriding"
        );
        envelope = envelope.with_sender(client.clone());
    }

    state.hooks.on_receive(client, envelope.payload());

    match state.router.route(&envelope) {
        Ok(_) => histograms::relay_latency_seconds(start.elapsed().as_secs_f64()),
        Err(e) => tracing::debug!(
            client = %client,
            receiver = %envelope.receiver(),
            kind = %e.kind(),
            "relay failed: {}",
            e
        ),
    }
    Ok(())
}

/// Serve one accepted TCP connection until it closes. `admission` is
/// released once the connection registers or its upgrade fails.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    admission: Admission,
) -> Result<(), ServerError> {
    let (ws_stream, client) = accept(stream, &state).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (handle, mailbox) = ConnHandle::new(client.clone(), state.config.outbound_queue);
    let mut lifecycle = Lifecycle::register(Arc::clone(&state), handle, peer_addr);
    drop(admission);

    let result = run_message_loop(&mut ws_tx, &mut ws_rx, mailbox, &state, &client).await;

    let error = match &result {
        Ok(Ended::Forced(CloseCause::Evicted)) => Some(ErrorKind::SendFailed),
        Ok(_) => None,
        Err(e) => e.kind(),
    };
    if let Ok(Ended::Forced(cause)) = &result {
        counters::disconnects_total(match cause {
            CloseCause::Superseded => "superseded",
            CloseCause::Evicted => "evicted",
            CloseCause::Shutdown => "shutdown",
        });
    }
    lifecycle.close(&mut ws_tx, error).await;

    result.map(|_| ())
}
