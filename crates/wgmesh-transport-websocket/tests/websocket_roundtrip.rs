//! Real-socket tests for the WebSocket transport

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use wgmesh_proto::{ClientType, ControlCodec, ControlMessage};
use wgmesh_transport::{PeerConnection, TransportListener};
use wgmesh_transport_websocket::{WebSocketClient, WebSocketConfig, WebSocketListener};

async fn bind_listener() -> (WebSocketListener, String) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = Arc::new(WebSocketConfig::plain("/ws"));
    let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("bind listener");
    let addr = listener.local_addr().unwrap();
    (listener, format!("ws://{}/ws", addr))
}

#[tokio::test]
async fn test_text_frames_flow_both_ways() {
    let (listener, url) = bind_listener().await;

    let client_task = tokio::spawn(async move {
        let mut client = WebSocketClient::connect(&url).await.unwrap();
        client
            .send(&ControlMessage::auth("agt_x", ClientType::Agent, None, None))
            .await
            .unwrap();
        let reply = client.recv().await.unwrap();
        client.close().await.ok();
        reply
    });

    let (mut conn, remote) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.remote_addr(), remote);

    let text = conn.recv_text().await.unwrap().unwrap();
    match ControlCodec::decode(&text).unwrap() {
        ControlMessage::Auth { api_key, .. } => assert_eq!(api_key, "agt_x"),
        other => panic!("unexpected message: {:?}", other),
    }

    conn.sender().send(ControlMessage::pong()).await.unwrap();

    let reply = timeout(Duration::from_secs(5), client_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(reply, Some(ControlMessage::Pong { .. })));
}

#[tokio::test]
async fn test_server_close_reaches_client() {
    let (listener, url) = bind_listener().await;

    let client_task = tokio::spawn(async move {
        let mut client = WebSocketClient::connect(&url).await.unwrap();
        let first = client.recv().await.unwrap();
        let second = client.recv().await.unwrap();
        (first, second)
    });

    let (conn, _) = listener.accept().await.unwrap();
    let sender = conn.sender();
    sender
        .send(ControlMessage::auth_error("Invalid API key"))
        .await
        .unwrap();
    sender.close("authentication failed").await.unwrap();

    let (first, second) = timeout(Duration::from_secs(5), client_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, Some(ControlMessage::AuthError { .. })));
    assert!(second.is_none());
}

#[tokio::test]
async fn test_client_hangup_ends_stream() {
    let (listener, url) = bind_listener().await;

    tokio::spawn(async move {
        let client = WebSocketClient::connect(&url).await.unwrap();
        client.close().await.ok();
    });

    let (mut conn, _) = listener.accept().await.unwrap();
    let next = timeout(Duration::from_secs(5), conn.recv_text())
        .await
        .unwrap();
    assert!(matches!(next, Ok(None) | Err(_)));
}

#[tokio::test]
async fn test_wrong_path_is_rejected() {
    let (listener, url) = bind_listener().await;
    let wrong = url.replace("/ws", "/other");

    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let result = WebSocketClient::connect(&wrong).await;
    assert!(result.is_err());
}

async fn bind_with_handshake_timeout(handshake_timeout: Duration) -> (WebSocketListener, String) {
    let config = Arc::new(WebSocketConfig::plain("/ws").with_handshake_timeout(handshake_timeout));
    let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("bind listener");
    let addr = listener.local_addr().unwrap();
    (listener, format!("ws://{}/ws", addr))
}

#[tokio::test]
async fn test_silent_socket_does_not_hold_up_other_peers() {
    let (listener, url) = bind_with_handshake_timeout(Duration::from_secs(3)).await;
    let addr = listener.local_addr().unwrap();

    // Opens TCP and never sends the upgrade request
    let _silent = tokio::net::TcpStream::connect(addr).await.unwrap();

    let client_task = tokio::spawn(async move {
        let client = WebSocketClient::connect(&url).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(client);
    });

    let started = tokio::time::Instant::now();
    let (_conn, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "well-behaved peer waited {:?}",
        started.elapsed()
    );

    client_task.await.unwrap();
}

#[tokio::test]
async fn test_stalled_handshake_is_dropped() {
    use tokio::io::AsyncReadExt;

    let (listener, _url) = bind_with_handshake_timeout(Duration::from_millis(200)).await;
    let addr = listener.local_addr().unwrap();

    let mut silent = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), silent.read(&mut buf))
        .await
        .expect("server should hang up on a stalled handshake");
    assert!(matches!(read, Ok(0) | Err(_)));
}
