//! Transport abstraction for persistent peer control connections
//!
//! A connection is split in two halves:
//! - the inbound side ([`PeerConnection`]) yields text frames in arrival order
//! - the outbound side ([`PeerSender`]) is a cloneable handle that queues
//!   frames for a per-connection writer and can be held by other tasks
//!   (session registry, broadcasts, liveness sweep)
//!
//! Concrete transports (WebSocket, in-memory) implement [`TransportListener`].

pub mod memory;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wgmesh_proto::ControlMessage;

/// How long a send may wait for room in a peer's outbound queue
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Depth of each connection's outbound queue
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to bind {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A frame queued for delivery to one peer
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Message(ControlMessage),
    /// Flush, then close the connection
    Close { reason: String },
}

/// Cloneable outbound handle for one connection
#[derive(Debug, Clone)]
pub struct PeerSender {
    connection_id: Uuid,
    tx: mpsc::Sender<OutboundFrame>,
    closed: CancellationToken,
}

impl PeerSender {
    /// Create a sender and the receiving end its writer drains
    pub fn channel() -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        (
            Self {
                connection_id: Uuid::new_v4(),
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue a message for the peer
    pub async fn send(&self, message: ControlMessage) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::StreamClosed);
        }
        self.enqueue(OutboundFrame::Message(message)).await
    }

    /// Queue a close frame and mark the connection closed.
    ///
    /// Idempotent; only the first call enqueues a frame.
    pub async fn close(&self, reason: impl Into<String>) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.enqueue(OutboundFrame::Close {
            reason: reason.into(),
        })
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once `close` has been called on any clone of this sender
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn enqueue(&self, frame: OutboundFrame) -> TransportResult<()> {
        match tokio::time::timeout(SEND_TIMEOUT, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::StreamClosed),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

/// Inbound half of an accepted connection
#[async_trait]
pub trait PeerConnection: Send + 'static {
    /// Next text frame, or `None` once the peer has gone away
    async fn recv_text(&mut self) -> TransportResult<Option<String>>;

    /// Outbound handle bound to this connection
    fn sender(&self) -> PeerSender;

    fn remote_addr(&self) -> SocketAddr;
}

/// Server-side listener producing peer connections
#[async_trait]
pub trait TransportListener: Send + Sync {
    type Connection: PeerConnection;

    /// Accept the next connection that completed its transport handshake
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    fn local_addr(&self) -> TransportResult<SocketAddr>;
}
