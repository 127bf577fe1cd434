//! Minimal peer-side WebSocket client
//!
//! Agents and gateways speak the control protocol through this; the
//! coordinator's own tests use it to drive a real socket.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;
use wgmesh_proto::{ControlCodec, ControlMessage};
use wgmesh_transport::{TransportError, TransportResult};

pub struct WebSocketClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: Url,
}

impl std::fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl WebSocketClient {
    /// Connect to `ws://host:port/path` or `wss://...`
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL: {}", e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::ConfigurationError(format!(
                "Unsupported scheme: {}",
                url.scheme()
            )));
        }

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| {
                TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
            })?;

        info!("WebSocket connection established to {}", url);
        Ok(Self { stream, url })
    }

    pub async fn send(&mut self, message: &ControlMessage) -> TransportResult<()> {
        let text = ControlCodec::encode(message)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.send_text(text).await
    }

    /// Send a raw text frame
    pub async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    /// Next control message, `None` once the server closed the connection
    pub async fn recv(&mut self) -> TransportResult<Option<ControlMessage>> {
        while let Some(result) = self.stream.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    return ControlCodec::decode(&text)
                        .map(Some)
                        .map_err(|e| TransportError::ProtocolError(e.to_string()));
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Server closed connection");
                    return Ok(None);
                }
                Ok(_) => continue,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return Ok(None),
                Err(e) => return Err(TransportError::ConnectionError(e.to_string())),
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) -> TransportResult<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }
}
