//! In-process channel transport
//!
//! Used by tests and embedders that drive the control plane without sockets.
//! A [`MemoryListener`] hands out [`MemoryConnection`]s for every
//! [`MemoryClient`] created through [`MemoryListener::connect`].

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::sync::{mpsc, Mutex};
use wgmesh_proto::{ControlCodec, ControlMessage};

use crate::{
    OutboundFrame, PeerConnection, PeerSender, TransportError, TransportListener, TransportResult,
};

/// Server side of an in-memory connection
#[derive(Debug)]
pub struct MemoryConnection {
    inbound: mpsc::Receiver<String>,
    sender: PeerSender,
    remote_addr: SocketAddr,
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn recv_text(&mut self) -> TransportResult<Option<String>> {
        Ok(self.inbound.recv().await)
    }

    fn sender(&self) -> PeerSender {
        self.sender.clone()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Peer side of an in-memory connection
#[derive(Debug)]
pub struct MemoryClient {
    outbound: Option<mpsc::Sender<String>>,
    inbound: mpsc::Receiver<OutboundFrame>,
}

impl MemoryClient {
    /// Send a control message to the server
    pub async fn send(&self, message: &ControlMessage) -> TransportResult<()> {
        let text = ControlCodec::encode(message)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.send_raw(text).await
    }

    /// Send an arbitrary text frame, valid JSON or not
    pub async fn send_raw(&self, text: impl Into<String>) -> TransportResult<()> {
        let tx = self.outbound.as_ref().ok_or(TransportError::StreamClosed)?;
        tx.send(text.into())
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    /// Next frame from the server, `None` once the server dropped the connection
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.inbound.recv().await
    }

    /// Next control message; `None` on a close frame or once dropped
    pub async fn recv_message(&mut self) -> Option<ControlMessage> {
        match self.inbound.recv().await {
            Some(OutboundFrame::Message(message)) => Some(message),
            _ => None,
        }
    }

    /// Hang up; the server observes end-of-stream
    pub fn disconnect(&mut self) {
        self.outbound = None;
    }
}

/// Create one connected pair without a listener
pub fn pair(remote_addr: SocketAddr) -> (MemoryConnection, MemoryClient) {
    let (client_tx, server_rx) = mpsc::channel(crate::OUTBOUND_QUEUE_DEPTH);
    let (sender, client_rx) = PeerSender::channel();

    (
        MemoryConnection {
            inbound: server_rx,
            sender,
            remote_addr,
        },
        MemoryClient {
            outbound: Some(client_tx),
            inbound: client_rx,
        },
    )
}

/// Listener whose connections are created in-process
#[derive(Debug)]
pub struct MemoryListener {
    pending_tx: mpsc::Sender<MemoryConnection>,
    pending_rx: Mutex<mpsc::Receiver<MemoryConnection>>,
    next_port: AtomicU16,
}

impl MemoryListener {
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(64);
        Self {
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
            next_port: AtomicU16::new(40000),
        }
    }

    /// Open a new client connection; the server side is yielded by `accept`
    pub async fn connect(&self) -> TransportResult<MemoryClient> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let (connection, client) = pair(remote);

        self.pending_tx
            .send(connection)
            .await
            .map_err(|_| TransportError::ConnectionError("listener closed".to_string()))?;
        Ok(client)
    }
}

impl Default for MemoryListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportListener for MemoryListener {
    type Connection = MemoryConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        let connection = self
            .pending_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::StreamClosed)?;
        let remote = connection.remote_addr;
        Ok((connection, remote))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }
}
