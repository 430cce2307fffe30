use crate::backoff::FixedBackoff;
use crate::connector::Connector;
use crate::error::EngineError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tether_common::{ClientId, Envelope};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the engine is in its connect/reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created, not yet started.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// Registered with the relay; `send` writes to the socket.
    Connected,
    /// The last attempt failed or the connection dropped; waiting to retry.
    Disconnected,
    /// Retries exhausted. Terminal.
    GivenUp,
    /// Stopped by the owner. Terminal.
    Stopped,
}

impl EngineState {
    /// Returns `true` for states the engine never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::GivenUp | Self::Stopped)
    }
}

/// Retry and liveness parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Wait between a failure and the next attempt.
    pub retry_interval: Duration,
    /// How often to ping the relay while connected.
    pub keepalive_interval: Duration,
    /// Drop the connection when nothing arrives for this long.
    pub idle_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_interval: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

type Handler = Arc<dyn Fn(Envelope) + Send + Sync>;
type Writer<C> = SplitSink<<C as Connector>::Transport, Message>;

struct Inner<C: Connector> {
    identity: ClientId,
    connector: C,
    config: EngineConfig,
    writer: tokio::sync::Mutex<Option<Writer<C>>>,
    handler: RwLock<Option<Handler>>,
    state: watch::Sender<EngineState>,
    stop: watch::Sender<bool>,
}

impl<C: Connector> Inner<C> {
    /// Move to `next` unless a terminal state has already been reached.
    fn transition(&self, next: EngineState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    /// Write one frame, bounded by the idle timeout. A write that times out
    /// drops the sink, since a partly written frame leaves it unusable.
    async fn write(&self, msg: Message) -> Result<(), EngineError> {
        let mut writer = self.writer.lock().await;
        if *self.stop.borrow() {
            *writer = None;
            return Err(EngineError::ConnectionClosed);
        }
        let sink = writer.as_mut().ok_or(EngineError::ConnectionClosed)?;
        let sent = tokio::time::timeout(self.config.idle_timeout, sink.send(msg));
        match sent.await {
            Ok(result) => result.map_err(EngineError::Write),
            Err(_) => {
                *writer = None;
                Err(EngineError::WriteTimeout)
            }
        }
    }

    /// Close the current sink. Gives up on the lock after [`CLOSE_TIMEOUT`];
    /// a sender stuck on a stalled socket drops the sink itself when its
    /// write times out.
    async fn close_writer(&self) {
        let locked = tokio::time::timeout(CLOSE_TIMEOUT, self.writer.lock());
        let Ok(mut writer) = locked.await else {
            debug!(client = %self.identity, "writer busy, leaving it to its own timeout");
            return;
        };
        if let Some(mut sink) = writer.take() {
            drop(writer);
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        }
    }

    fn dispatch(&self, data: &[u8]) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "skipping undecodable frame");
                return;
            }
        };
        if envelope.receiver() != &self.identity {
            debug!(
                receiver = %envelope.receiver(),
                "skipping envelope addressed to another client"
            );
            return;
        }
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(envelope),
            None => debug!(sender = %envelope.sender(), "no receive callback installed"),
        }
    }
}

/// Keeps one logical connection to the relay alive across drops, retrying
/// at a fixed interval until a run of consecutive failures exhausts the
/// budget.
pub struct ReconnectEngine<C: Connector> {
    inner: Arc<Inner<C>>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ReconnectEngine<C> {
    /// Create an idle engine for `identity`. Nothing connects until
    /// [`ReconnectEngine::start`].
    #[must_use]
    pub fn new(identity: ClientId, connector: C, config: EngineConfig) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                identity,
                connector,
                config,
                writer: tokio::sync::Mutex::new(None),
                handler: RwLock::new(None),
                state,
                stop,
            }),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Install the callback for envelopes addressed to this client,
    /// replacing any previous one. Runs on the engine's task, so it should
    /// return quickly.
    pub fn on_receive<F>(&self, callback: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// This client's registration identity.
    #[must_use]
    pub fn identity(&self) -> &ClientId {
        &self.inner.identity
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    /// Spawn the supervisor task. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyStarted`] on a second call, or
    /// [`EngineError::Stopped`] if [`ReconnectEngine::stop`] already ran.
    pub fn start(&self) -> Result<(), EngineError> {
        if *self.inner.stop.borrow() {
            return Err(EngineError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }
        self.inner.transition(EngineState::Connecting);
        let handle = tokio::spawn(supervise(Arc::clone(&self.inner)));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Write `envelope` to the relay if connected.
    ///
    /// Returns `false` without buffering when there is no live connection or
    /// the write fails.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode envelope");
                return false;
            }
        };
        let len = text.len();
        match self.inner.write(Message::Text(text)).await {
            Ok(()) => {
                debug!(receiver = %envelope.receiver(), bytes = len, "sent");
                true
            }
            Err(EngineError::ConnectionClosed) => {
                debug!(receiver = %envelope.receiver(), "not connected, dropping message");
                false
            }
            Err(e) => {
                debug!(error = %e, "send failed");
                false
            }
        }
    }

    /// Send `payload` to `receiver` as this client.
    pub async fn send_to(
        &self,
        receiver: impl Into<ClientId>,
        payload: impl Into<Vec<u8>>,
    ) -> bool {
        let envelope = Envelope::new(self.inner.identity.clone(), receiver, payload);
        self.send(&envelope).await
    }

    /// Stop the engine: cancel any connect or backoff in flight, close the
    /// connection and wait for the supervisor to exit. Safe to call more than
    /// once.
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("engine task panicked: {}", e);
                }
            }
        }
        self.inner.close_writer().await;
        self.inner.transition(EngineState::Stopped);
    }

    /// Wait for the engine to reach a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MaxRetriesExceeded`] if the engine gave up, or
    /// [`EngineError::NotStarted`] if it was never started. An engine stopped
    /// before it was started reports `Ok(())`.
    pub async fn finished(&self) -> Result<(), EngineError> {
        let mut rx = self.inner.state.subscribe();
        if *rx.borrow() == EngineState::Idle {
            return Err(EngineError::NotStarted);
        }
        let state = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match state {
            Ok(EngineState::GivenUp) => Err(EngineError::MaxRetriesExceeded {
                attempts: self.inner.config.max_attempts,
            }),
            _ => Ok(()),
        }
    }
}

impl<C: Connector> Drop for ReconnectEngine<C> {
    fn drop(&mut self) {
        self.inner.stop.send_replace(true);
    }
}

/// Resolves once a stop has been requested.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await.is_ok();
}

async fn supervise<C: Connector>(inner: Arc<Inner<C>>) {
    let mut stop = inner.stop.subscribe();
    let mut backoff = FixedBackoff::new(inner.config.retry_interval, inner.config.max_attempts);

    let final_state = loop {
        if *stop.borrow() {
            break EngineState::Stopped;
        }
        inner.transition(EngineState::Connecting);
        let attempt = backoff.attempts() + 1;
        debug!(client = %inner.identity, attempt, "connecting");

        let connected = tokio::select! {
            result = inner.connector.connect() => result,
            () = stop_requested(&mut stop) => break EngineState::Stopped,
        };

        match connected {
            Ok(transport) => {
                backoff.reset();
                let (sink, stream) = transport.split();
                *inner.writer.lock().await = Some(sink);
                inner.transition(EngineState::Connected);
                info!(client = %inner.identity, "connected to relay");

                let outcome = tokio::select! {
                    result = run_connection(&inner, stream) => result,
                    () = stop_requested(&mut stop) => {
                        inner.close_writer().await;
                        break EngineState::Stopped;
                    }
                };
                inner.close_writer().await;
                match outcome {
                    Ok(()) => info!(client = %inner.identity, "relay closed the connection"),
                    Err(e) => warn!(client = %inner.identity, error = %e, "relay connection lost"),
                }
            }
            Err(e) => {
                warn!(
                    client = %inner.identity,
                    attempt,
                    error = %EngineError::Connect(e),
                    "connection attempt failed"
                );
            }
        }

        inner.transition(EngineState::Disconnected);
        let Some(delay) = backoff.next_delay() else {
            error!(
                client = %inner.identity,
                attempts = backoff.attempts(),
                "retries exhausted, giving up"
            );
            break EngineState::GivenUp;
        };
        info!(
            attempt = backoff.attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = stop_requested(&mut stop) => break EngineState::Stopped,
        }
    };

    inner.transition(final_state);
}

async fn run_connection<C: Connector>(
    inner: &Inner<C>,
    mut stream: SplitStream<C::Transport>,
) -> Result<(), EngineError> {
    let keepalive = inner.config.keepalive_interval;
    let mut ping_interval = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = tokio::time::sleep(inner.config.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = msg.ok_or(EngineError::ConnectionClosed)??;
                idle.as_mut().reset(Instant::now() + inner.config.idle_timeout);
                match msg {
                    Message::Text(text) => inner.dispatch(text.as_bytes()),
                    Message::Binary(data) => inner.dispatch(&data),
                    Message::Ping(data) => inner.write(Message::Pong(data)).await?,
                    Message::Close(_) => return Ok(()),
                    Message::Pong(_) | Message::Frame(_) => {}
                }
            }
            _ = ping_interval.tick() => {
                inner.write(Message::Ping(Vec::new())).await?;
            }
            () = &mut idle => {
                return Err(EngineError::IdleTimeout);
            }
        }
    }
}
