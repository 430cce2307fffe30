use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::ServerError;
use crate::hooks::{ConnectionHooks, NoopHooks};
use crate::idle::wait_for_idle;
use crate::registry::{CloseCause, Registry};
use crate::router::Router;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the relay server.
pub struct ServerState {
    /// Relays envelopes between registered connections.
    pub router: Router,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Lifecycle observer.
    pub hooks: Arc<dyn ConnectionHooks>,
    shutting_down: AtomicBool,
}

impl ServerState {
    /// Create state with an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig, hooks: Arc<dyn ConnectionHooks>) -> Self {
        Self {
            router: Router::new(Arc::new(Registry::new())),
            config,
            hooks,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Identity → connection registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        self.router.registry()
    }

    /// Returns `true` once the server has stopped accepting connections.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Why [`Server::run_with_shutdown`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// The external shutdown signal fired.
    Shutdown,
    /// The last client left and none arrived within the idle grace period.
    Idle,
}

/// The relay server. Runs at most once.
pub struct Server {
    state: Arc<ServerState>,
    started: Mutex<bool>,
}

impl Server {
    /// Create a server with no-op hooks.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_hooks(config, Arc::new(NoopHooks))
    }

    /// Create a server that reports lifecycle events to `hooks`.
    #[must_use]
    pub fn with_hooks(config: ServerConfig, hooks: Arc<dyn ConnectionHooks>) -> Self {
        Self {
            state: Arc::new(ServerState::new(config, hooks)),
            started: Mutex::new(false),
        }
    }

    /// Shared state, for inspecting the registry.
    #[must_use]
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Run until the registry goes idle.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyStarted`] if the server has already run,
    /// or an I/O error if the listener address cannot be read.
    pub async fn run(&self, listener: TcpListener) -> Result<ServerExit, ServerError> {
        self.run_with_shutdown(listener, std::future::pending()).await
    }

    /// Run the accept loop until `shutdown` resolves or the registry goes
    /// idle, then close every connection and wait for their tasks to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyStarted`] if the server has already run,
    /// or an I/O error if the listener address cannot be read.
    pub async fn run_with_shutdown<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<ServerExit, ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        {
            let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
            if *started {
                return Err(ServerError::AlreadyStarted);
            }
            *started = true;
        }

        let local_addr = listener.local_addr()?;
        info!(
            "relay listening on {}{}",
            local_addr, self.state.config.path
        );

        let idle = wait_for_idle(self.state.registry().subscribe(), self.state.config.idle_grace);
        tokio::pin!(idle);
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        let exit = loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let admission = self.state.router.registry().admit();
                            tasks.spawn(async move {
                                let served = handle_connection(stream, addr, state, admission);
                                if let Err(e) = served.await {
                                    tracing::debug!("connection from {} closed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("connection task panicked: {}", e);
                        }
                    }
                }
                () = &mut idle => {
                    info!("no clients remain after idle grace period, shutting down");
                    break ServerExit::Idle;
                }
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    break ServerExit::Shutdown;
                }
            }
        };

        drop(listener);
        self.state.shutting_down.store(true, Ordering::SeqCst);
        let closed = self.state.registry().close_all(CloseCause::Shutdown);
        info!("draining {} connections ({} registered)", tasks.len(), closed);

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "drain timeout reached with {} connections still active",
                tasks.len()
            );
            tasks.abort_all();
        }

        info!("server shut down gracefully");
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn run_returns_on_shutdown_signal() {
        let server = Server::new(test_config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let exit = server
            .run_with_shutdown(listener, async {})
            .await
            .unwrap();
        assert_eq!(exit, ServerExit::Shutdown);
        assert!(server.state().is_shutting_down());
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let server = Server::new(test_config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        server.run_with_shutdown(listener, async {}).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = server.run_with_shutdown(listener, async {}).await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyStarted));
    }

    #[tokio::test]
    async fn new_state_is_empty() {
        let state = ServerState::new(test_config(), Arc::new(NoopHooks));
        assert!(state.registry().is_empty());
        assert!(!state.is_shutting_down());
    }
}
