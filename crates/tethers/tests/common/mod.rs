#![allow(dead_code)]

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_common::types::CLIENT_ID_HEADER;
use tether_common::{ClientId, Envelope, ErrorKind};
use tethers::config::ServerConfig;
use tethers::{ConnectionHooks, NoopHooks, Server, ServerError, ServerExit, ServerState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderName;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        ping_interval: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(5),
        idle_grace: Duration::ZERO,
        handshake_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<Server>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<ServerExit, ServerError>>,
}

impl TestServer {
    pub fn state(&self) -> &Arc<ServerState> {
        self.server.state()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the server to exit on its own.
    pub async fn exit(self) -> ServerExit {
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server did not exit")
            .unwrap()
            .unwrap()
    }

    /// Fire the shutdown signal and wait for the server to exit.
    pub async fn shutdown(mut self) -> ServerExit {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.exit().await
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(test_config(), Arc::new(NoopHooks)).await
}

pub async fn start_server_with(
    config: ServerConfig,
    hooks: Arc<dyn ConnectionHooks>,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::with_hooks(config, hooks));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            server
                .run_with_shutdown(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        server,
        shutdown: Some(shutdown_tx),
        task,
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub struct TestClient {
    pub ws_tx: SplitSink<WsStream, Message>,
    pub ws_rx: SplitStream<WsStream>,
    pub id: ClientId,
}

impl TestClient {
    pub async fn try_connect(
        addr: &SocketAddr,
        path: &str,
        client_id: Option<&str>,
    ) -> Result<Self, tungstenite::Error> {
        let mut req = format!("ws://{addr}{path}").into_client_request()?;
        if let Some(id) = client_id {
            req.headers_mut().insert(
                HeaderName::from_bytes(CLIENT_ID_HEADER.as_bytes()).unwrap(),
                id.parse().unwrap(),
            );
        }
        let (ws, _) = tokio_tungstenite::connect_async(req).await?;
        let (ws_tx, ws_rx) = ws.split();
        Ok(Self {
            ws_tx,
            ws_rx,
            id: ClientId::new(client_id.unwrap_or_default()),
        })
    }

    pub async fn connect(addr: &SocketAddr, client_id: &str) -> Self {
        Self::try_connect(addr, "/ws", Some(client_id)).await.unwrap()
    }

    pub async fn send_to(&mut self, receiver: &str, payload: &[u8]) {
        let envelope = Envelope::new(self.id.clone(), receiver, payload.to_vec());
        self.send_envelope(&envelope).await;
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) {
        self.send_raw(envelope.encode().unwrap()).await;
    }

    pub async fn send_raw(&mut self, text: String) {
        self.ws_tx.send(Message::Text(text)).await.unwrap();
    }

    pub async fn recv(&mut self) -> Envelope {
        self.recv_timeout(Duration::from_secs(5))
            .await
            .expect("timeout waiting for envelope")
    }

    /// Next envelope within `timeout`, or `None` on timeout or close.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws_rx.next()).await.ok()??;
            match msg.ok()? {
                Message::Text(text) => return Some(Envelope::decode(text.as_bytes()).unwrap()),
                Message::Binary(data) => return Some(Envelope::decode(&data).unwrap()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Close(_) => return None,
            }
        }
    }

    /// Read until the server closes the connection. Returns `false` if it
    /// stays open for five seconds.
    pub async fn closed_by_server(&mut self) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match tokio::time::timeout_at(deadline, self.ws_rx.next()).await {
                Err(_) => return false,
                Ok(None | Some(Err(_) | Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.close().await;
        // Drain until the server acknowledges.
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(_)) = self.ws_rx.next().await {}
        })
        .await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect(String),
    Receive(String, Vec<u8>),
    Disconnect(String, Option<ErrorKind>),
}

#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<Event>>,
}

impl RecordingHooks {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn disconnects(&self, client: &str) -> Vec<Option<ErrorKind>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Disconnect(id, error) if id == client => Some(error),
                _ => None,
            })
            .collect()
    }
}

impl ConnectionHooks for RecordingHooks {
    fn on_connect(&self, client: &ClientId) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Connect(client.to_string()));
    }

    fn on_disconnect(&self, client: &ClientId, error: Option<ErrorKind>) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Disconnect(client.to_string(), error));
    }

    fn on_receive(&self, client: &ClientId, payload: &[u8]) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Receive(client.to_string(), payload.to_vec()));
    }
}
