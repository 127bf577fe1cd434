//! WebSocket transport implementation using tokio-tungstenite
//!
//! Each control message travels as one JSON text frame. The listener accepts
//! plain `ws://` or, when a certificate is configured, `wss://` via rustls,
//! and only upgrades requests on the configured path.

pub mod client;
pub mod config;
pub mod connection;
pub mod listener;

pub use client::WebSocketClient;
pub use config::WebSocketConfig;
pub use connection::WebSocketConnection;
pub use listener::WebSocketListener;
