//! Idle and connect timeouts against a real listener.
//!
//! Serialized because the assertions depend on wall-clock spacing.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{registry, server_config, start_server, transport, Chat};
use secure_channel::config::{ClientConfig, ServerConfig};
use secure_channel::{ChannelState, Client, Dispatcher, ProtocolError};
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const IDLE: Duration = Duration::from_millis(1000);

fn idle_server_config() -> ServerConfig {
    ServerConfig {
        idle_timeout: Some(IDLE),
        ..server_config()
    }
}

#[tokio::test]
#[serial]
async fn test_idle_channel_is_closed_by_server() {
    let harness = start_server(
        idle_server_config(),
        &transport(),
        Arc::new(Dispatcher::new()),
        registry(),
    )
    .await;
    let client = common::client(Arc::new(Dispatcher::new()), registry());
    let channel = client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await
        .unwrap();

    let started = Instant::now();
    let cause = timeout(Duration::from_secs(5), channel.closed())
        .await
        .expect("idle channel was never closed");
    let elapsed = started.elapsed();

    // The client sees the server hang up; the server recorded the timeout.
    assert!(matches!(cause, ProtocolError::ConnectionClosed), "cause: {cause}");
    assert!(elapsed >= Duration::from_millis(800), "closed too early: {elapsed:?}");
    assert_eq!(harness.server.metrics().snapshot().timeouts, 1);
    assert_eq!(harness.server.active_count(), 0);

    harness.stop().await;
}

#[tokio::test]
#[serial]
async fn test_traffic_keeps_channel_open() {
    let harness = start_server(
        idle_server_config(),
        &transport(),
        Arc::new(Dispatcher::new()),
        registry(),
    )
    .await;
    let client = common::client(Arc::new(Dispatcher::new()), registry());
    let channel = client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await
        .unwrap();

    for seq in 0..4 {
        sleep(Duration::from_millis(800)).await;
        channel
            .send(&Chat {
                from: 0,
                seq,
                text: "keepalive".into(),
            })
            .await
            .expect("channel closed despite traffic");
    }
    assert_eq!(channel.state(), ChannelState::Ready);
    assert_eq!(harness.server.active_count(), 1);
    assert_eq!(harness.server.metrics().snapshot().timeouts, 0);

    client.close();
    harness.stop().await;
}

#[tokio::test]
#[serial]
async fn test_connect_to_closed_port_fails() {
    // Bind then drop to find a port nobody listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = Client::new(
        &ClientConfig {
            connection_timeout: Duration::from_millis(500),
            ..common::client_config()
        },
        &transport(),
        Arc::new(Dispatcher::new()),
        registry(),
    );

    let err = client
        .connect("127.0.0.1", port, CancellationToken::new())
        .await
        .expect_err("connected to a closed port");
    assert!(err.is_transport(), "unexpected error: {err}");
    assert!(!client.is_connected());
}

#[tokio::test]
#[serial]
async fn test_cancelled_connect() {
    let harness = start_server(
        server_config(),
        &transport(),
        Arc::new(Dispatcher::new()),
        registry(),
    )
    .await;
    let client = common::client(Arc::new(Dispatcher::new()), registry());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client
        .connect("127.0.0.1", harness.port(), cancel)
        .await
        .expect_err("cancelled connect succeeded");
    assert!(matches!(err, ProtocolError::Cancelled));
    harness.stop().await;
}

#[tokio::test]
#[serial]
async fn test_second_connect_while_open_is_rejected() {
    let harness = start_server(
        server_config(),
        &transport(),
        Arc::new(Dispatcher::new()),
        registry(),
    )
    .await;
    let client = common::client(Arc::new(Dispatcher::new()), registry());
    let first = client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await
        .unwrap();

    let again = client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await;
    assert!(matches!(again, Err(ProtocolError::AlreadyConnected)));

    // After a close the client may connect again.
    client.close();
    timeout(Duration::from_secs(5), first.closed()).await.unwrap();
    let second = client
        .connect("127.0.0.1", harness.port(), CancellationToken::new())
        .await
        .unwrap();
    assert_ne!(first.id(), second.id());
    assert!(client.is_connected());

    client.close();
    harness.stop().await;
}
