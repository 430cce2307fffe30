use crate::error::EngineError;
use futures_util::sink::Sink;
use futures_util::stream::Stream;
use std::future::Future;
use tether_common::types::CLIENT_ID_HEADER;
use tether_common::ClientId;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Client-side WebSocket over plain TCP or TLS.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens transports for the reconnect engine.
///
/// Each call to [`Connector::connect`] is one connection attempt; the engine
/// owns retry policy.
pub trait Connector: Send + Sync + 'static {
    /// Bidirectional message transport produced by a successful attempt.
    type Transport: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Send
        + Unpin
        + 'static;

    /// Make one connection attempt.
    fn connect(&self) -> impl Future<Output = Result<Self::Transport, tungstenite::Error>> + Send;
}

/// Connects to a relay over WebSocket, registering with the `Client-ID`
/// header.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    header: HeaderName,
    identity: HeaderValue,
    config: WebSocketConfig,
}

impl WsConnector {
    /// Validate `url` and `identity` up front so that every later attempt
    /// can only fail on the network.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidUrl`] if `url` is not a WebSocket URL,
    /// or [`EngineError::InvalidHeader`] if the identity cannot be carried in
    /// an HTTP header.
    pub fn new(url: impl Into<String>, identity: &ClientId) -> Result<Self, EngineError> {
        let url = url.into();
        url.as_str()
            .into_client_request()
            .map_err(EngineError::InvalidUrl)?;
        let header = HeaderName::from_bytes(CLIENT_ID_HEADER.as_bytes())
            .map_err(|e| EngineError::InvalidHeader(e.to_string()))?;
        let identity = HeaderValue::from_bytes(identity.as_str().as_bytes())
            .map_err(|e| EngineError::InvalidHeader(e.to_string()))?;
        Ok(Self {
            url,
            header,
            identity,
            config: WebSocketConfig::default(),
        })
    }

    /// Limit the size of frames and messages accepted from the relay.
    #[must_use]
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = Some(bytes);
        self.config.max_frame_size = Some(bytes);
        self
    }

    /// The URL this connector dials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    type Transport = WsStream;

    async fn connect(&self) -> Result<WsStream, tungstenite::Error> {
        let mut req = self.url.as_str().into_client_request()?;
        req.headers_mut()
            .insert(self.header.clone(), self.identity.clone());
        let (ws, _) =
            tokio_tungstenite::connect_async_with_config(req, Some(self.config), false).await?;
        Ok(ws)
    }
}
