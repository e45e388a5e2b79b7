//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use secure_channel::config::{ClientConfig, ServerConfig, TransportConfig};
use secure_channel::core::serialization::SerializationFormat;
use secure_channel::{Channel, Client, Dispatcher, Message, MessageRegistry, Result, Server};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub from: u32,
    pub seq: u32,
    pub text: String,
}
impl Message for Chat {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub data: Vec<u8>,
}
impl Message for Blob {}

pub fn registry() -> Arc<MessageRegistry> {
    registry_with(SerializationFormat::Bincode)
}

pub fn registry_with(format: SerializationFormat) -> Arc<MessageRegistry> {
    Arc::new(
        MessageRegistry::builder()
            .format(format)
            .register::<Chat>()
            .unwrap()
            .register::<Blob>()
            .unwrap()
            .build(),
    )
}

/// Small keys keep the handshake fast in tests.
pub fn transport() -> TransportConfig {
    TransportConfig {
        rsa_key_bits: 1024,
        ..TransportConfig::default()
    }
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        address: "127.0.0.1:0".into(),
        handshake_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        connection_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

pub struct Harness {
    pub server: Arc<Server>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<()>>,
}

impl Harness {
    pub fn port(&self) -> u16 {
        self.server.local_addr().port()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        self.task.await.expect("server task").expect("server run");
    }
}

pub async fn start_server(
    config: ServerConfig,
    transport: &TransportConfig,
    dispatcher: Arc<Dispatcher<Channel>>,
    registry: Arc<MessageRegistry>,
) -> Harness {
    let server = Server::bind(&config, transport, dispatcher, registry)
        .await
        .expect("bind");
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&server).run(cancel.clone()));
    Harness {
        server,
        cancel,
        task,
    }
}

pub fn client(dispatcher: Arc<Dispatcher<Channel>>, registry: Arc<MessageRegistry>) -> Client {
    Client::new(&client_config(), &transport(), dispatcher, registry)
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
