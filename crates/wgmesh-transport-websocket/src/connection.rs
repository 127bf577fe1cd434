//! Server-side WebSocket connection

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, trace, warn};
use wgmesh_proto::ControlCodec;
use wgmesh_transport::{
    OutboundFrame, PeerConnection, PeerSender, TransportError, TransportResult,
};

/// Byte stream under the WebSocket, plain TCP or TLS
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub type BoxedIo = Box<dyn IoStream>;

type WsStream = tokio_tungstenite::WebSocketStream<BoxedIo>;

/// Accepted WebSocket carrying JSON control frames
pub struct WebSocketConnection {
    source: SplitStream<WsStream>,
    sender: PeerSender,
    remote_addr: SocketAddr,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("connection_id", &self.sender.connection_id())
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl WebSocketConnection {
    /// Wrap an upgraded stream and spawn its writer task
    pub fn new(ws_stream: WsStream, remote_addr: SocketAddr) -> Self {
        let (sink, source) = ws_stream.split();
        let (sender, frame_rx) = PeerSender::channel();

        let conn_id = sender.connection_id();
        tokio::spawn(async move {
            Self::writer_task(sink, frame_rx, conn_id.to_string()).await;
        });

        Self {
            source,
            sender,
            remote_addr,
        }
    }

    /// Writer task - drains the outbound queue into the socket
    async fn writer_task(
        mut sink: SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<OutboundFrame>,
        conn_id: String,
    ) {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Message(message) => {
                    let text = match ControlCodec::encode(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(connection_id = %conn_id, "Failed to encode message: {}", e);
                            continue;
                        }
                    };
                    trace!(connection_id = %conn_id, message_type = message.message_type(), "Sending frame");
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(connection_id = %conn_id, "WebSocket send error: {}", e);
                        break;
                    }
                }
                OutboundFrame::Close { reason } => {
                    debug!(connection_id = %conn_id, %reason, "Closing WebSocket");
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }

        debug!(connection_id = %conn_id, "WebSocket writer task ended");
        let _ = sink.close().await;
    }
}

#[async_trait]
impl PeerConnection for WebSocketConnection {
    async fn recv_text(&mut self) -> TransportResult<Option<String>> {
        while let Some(result) = self.source.next().await {
            match result {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Binary(data)) => {
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong is automatically handled by tungstenite
                    trace!(remote_addr = %self.remote_addr, "WebSocket keep-alive frame");
                }
                Ok(Message::Close(_)) => {
                    debug!(remote_addr = %self.remote_addr, "WebSocket close received");
                    return Ok(None);
                }
                Ok(Message::Frame(_)) => {}
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return Ok(None),
                Err(e) => {
                    return Err(TransportError::ConnectionError(format!(
                        "WebSocket read error: {}",
                        e
                    )))
                }
            }
        }
        Ok(None)
    }

    fn sender(&self) -> PeerSender {
        self.sender.clone()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}
