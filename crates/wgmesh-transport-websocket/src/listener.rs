//! WebSocket listener
//!
//! A background task owns the TCP socket. Every accepted stream gets its own
//! handshake task (TLS when configured, then the WebSocket upgrade) bounded
//! by the configured handshake timeout, and finished connections are queued
//! for [`TransportListener::accept`]. A peer that stalls mid-handshake only
//! holds up its own task.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};
use wgmesh_transport::{TransportError, TransportListener, TransportResult};

use crate::config::WebSocketConfig;
use crate::connection::{BoxedIo, WebSocketConnection};

/// Upgraded connections waiting for `accept`
const ACCEPT_QUEUE: usize = 64;

/// Pause after a failed TCP accept, e.g. when out of file descriptors
const TCP_ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type Accepted = (WebSocketConnection, SocketAddr);

/// WebSocket listener for accepting incoming peer connections
pub struct WebSocketListener {
    local_addr: SocketAddr,
    tls: bool,
    ready: Mutex<mpsc::Receiver<Accepted>>,
    acceptor_task: JoinHandle<()>,
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Everything a handshake task needs, shared across tasks
struct Upgrader {
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    config: Arc<WebSocketConfig>,
}

impl Upgrader {
    async fn upgrade(
        &self,
        tcp_stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> TransportResult<WebSocketConnection> {
        let io: BoxedIo = match &self.tls_acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(tcp_stream)
                    .await
                    .map_err(|e| TransportError::TlsError(e.to_string()))?;
                debug!(%remote_addr, "TLS established");
                Box::new(tls_stream)
            }
            None => Box::new(tcp_stream),
        };

        let config = self.config.clone();
        let check_path = move |req: &Request, response: Response| {
            if config.matches_path(req.uri().path()) {
                return Ok(response);
            }
            let mut not_found = ErrorResponse::new(None);
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Err(not_found)
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(io, check_path)
            .await
            .map_err(|e| TransportError::ProtocolError(format!("upgrade refused: {}", e)))?;

        Ok(WebSocketConnection::new(ws_stream, remote_addr))
    }

    /// Upgrade one socket and queue it; failures and timeouts are dropped
    async fn serve_one(
        self: Arc<Self>,
        tcp_stream: TcpStream,
        remote_addr: SocketAddr,
        ready: mpsc::Sender<Accepted>,
    ) {
        let deadline = self.config.handshake_timeout;
        let connection =
            match tokio::time::timeout(deadline, self.upgrade(tcp_stream, remote_addr)).await {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => {
                    warn!(%remote_addr, "Dropping connection: {}", e);
                    return;
                }
                Err(_) => {
                    warn!(%remote_addr, ?deadline, "Dropping connection: no upgrade in time");
                    return;
                }
            };

        info!(%remote_addr, "Peer connected over WebSocket");
        if ready.send((connection, remote_addr)).await.is_err() {
            debug!(%remote_addr, "Listener gone before the connection was taken");
        }
    }
}

async fn accept_loop(
    tcp_listener: TcpListener,
    upgrader: Arc<Upgrader>,
    ready: mpsc::Sender<Accepted>,
) {
    loop {
        tokio::select! {
            _ = ready.closed() => break,
            accepted = tcp_listener.accept() => match accepted {
                Ok((tcp_stream, remote_addr)) => {
                    debug!(%remote_addr, "TCP accepted, starting handshake");
                    tokio::spawn(upgrader.clone().serve_one(tcp_stream, remote_addr, ready.clone()));
                }
                Err(e) => {
                    warn!("TCP accept failed: {}", e);
                    tokio::time::sleep(TCP_ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

impl WebSocketListener {
    pub async fn bind(bind_addr: SocketAddr, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;
        let tls_acceptor = config.build_tls_acceptor()?;
        let tls = tls_acceptor.is_some();

        let tcp_listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TransportError::BindError {
                address: bind_addr.ip().to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            })?;
        let local_addr = tcp_listener.local_addr().map_err(TransportError::IoError)?;
        info!(
            "Listening for peers on {}://{}{}",
            config.scheme(),
            local_addr,
            config.path
        );

        let (ready_tx, ready_rx) = mpsc::channel(ACCEPT_QUEUE);
        let upgrader = Arc::new(Upgrader {
            tls_acceptor,
            config,
        });
        let acceptor_task = tokio::spawn(accept_loop(tcp_listener, upgrader, ready_tx));

        Ok(Self {
            local_addr,
            tls,
            ready: Mutex::new(ready_rx),
            acceptor_task,
        })
    }
}

impl Drop for WebSocketListener {
    fn drop(&mut self) {
        self.acceptor_task.abort();
    }
}

#[async_trait]
impl TransportListener for WebSocketListener {
    type Connection = WebSocketConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        self.ready
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::ConnectionError("listener stopped".to_string()))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }
}
