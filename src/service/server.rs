//! # Server
//!
//! Accepts TCP connections, wraps each in a [`Channel`] playing the server
//! role, and tracks the channels that completed their handshake.
//!
//! Channel events are fanned out to server-level observers. Shutdown stops
//! accepting, closes every channel and waits (bounded) for them to drain.

use crate::config::{ServerConfig, TransportConfig};
use crate::core::message::{Envelope, Message};
use crate::core::registry::MessageRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::service::channel::{Channel, ChannelOptions, Role};
use crate::service::observer::ChannelObserver;
use crate::utils::metrics::Metrics;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// TCP listener producing server-role channels.
pub struct Server {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    config: ServerConfig,
    options: ChannelOptions,
    dispatcher: Arc<Dispatcher<Channel>>,
    registry: Arc<MessageRegistry>,
    active: Mutex<HashMap<Uuid, Channel>>,
    connections: AtomicUsize,
    observers: RwLock<Vec<Arc<dyn ChannelObserver>>>,
    listening: AtomicBool,
}

impl Server {
    /// Bind the listen address. Accepting starts with [`run`](Self::run).
    pub async fn bind(
        config: &ServerConfig,
        transport: &TransportConfig,
        dispatcher: Arc<Dispatcher<Channel>>,
        registry: Arc<MessageRegistry>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(&config.address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server bound");

        Ok(Arc::new(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            config: config.clone(),
            options: ChannelOptions::for_server(config, transport),
            dispatcher,
            registry,
            active: Mutex::new(HashMap::new()),
            connections: AtomicUsize::new(0),
            observers: RwLock::new(Vec::new()),
            listening: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.options.metrics)
    }

    /// Observe events from every channel this server accepts from now on.
    pub fn subscribe(&self, observer: Arc<dyn ChannelObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Channels that completed the handshake and have not closed.
    pub fn channels(&self) -> Vec<Channel> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Accepted connections still running, including those mid-handshake.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Send `message` to every ready channel; returns how many sends succeeded.
    pub async fn broadcast<M: Message>(&self, message: &M) -> usize {
        let mut delivered = 0;
        for channel in self.channels() {
            match channel.send(message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(channel = %channel.id(), error = %e, "Broadcast send failed");
                }
            }
        }
        delivered
    }

    /// Accept connections until `cancel` fires, then shut down.
    ///
    /// # Errors
    /// Fails if the server is already running or has run before.
    #[instrument(skip_all, fields(address = %self.local_addr))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ProtocolError::Custom("Server is already running".into()))?;

        self.listening.store(true, Ordering::Release);
        info!("Listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutting down server. Waiting for connections to close...");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => self.accept(stream, peer, &cancel),
                        Err(e) => {
                            self.options.metrics.connection_error();
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }

        drop(listener);
        self.listening.store(false, Ordering::Release);
        self.drain().await;
        self.options.metrics.log_metrics();
        Ok(())
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
        let metrics = &self.options.metrics;
        if self.connections.load(Ordering::Acquire) >= self.config.max_connections {
            metrics.connection_rejected();
            warn!(peer = %peer, limit = self.config.max_connections, "Connection limit reached, rejecting");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        self.connections.fetch_add(1, Ordering::AcqRel);
        metrics.connection_established();
        debug!(peer = %peer, "Connection accepted");

        let channel = Channel::new(
            stream,
            Some(peer),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.registry),
            self.options.clone(),
        );
        channel.subscribe(Arc::new(Tracker {
            server: Arc::downgrade(self),
        }));

        let server = Arc::clone(self);
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let _ = channel.begin_receive(Role::Server, cancel).await;
            server.connections.fetch_sub(1, Ordering::AcqRel);
            server.options.metrics.connection_closed();
        });
    }

    async fn drain(&self) {
        for channel in self.channels() {
            channel.close();
        }

        let deadline = tokio::time::sleep(self.config.shutdown_timeout);
        tokio::pin!(deadline);

        loop {
            let remaining = self.connections.load(Ordering::Acquire);
            if remaining == 0 {
                info!("All connections closed, shutting down");
                return;
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!(connections = remaining, "Shutdown timeout reached, forcing exit");
                    return;
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {
                    debug!(connections = remaining, "Waiting for connections to close");
                }
            }
        }
    }

    fn fan_out(&self, event: impl Fn(&dyn ChannelObserver)) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            event(observer.as_ref());
        }
    }
}

/// Keeps the active set current and forwards events to server observers.
struct Tracker {
    server: Weak<Server>,
}

impl ChannelObserver for Tracker {
    fn on_handshaked(&self, channel: &Channel) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        server
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.id(), channel.clone());
        server.fan_out(|observer| observer.on_handshaked(channel));
    }

    fn on_message(&self, channel: &Channel, envelope: &Envelope) {
        if let Some(server) = self.server.upgrade() {
            server.fan_out(|observer| observer.on_message(channel, envelope));
        }
    }

    fn on_closed(&self, channel: &Channel, cause: &ProtocolError) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        server
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel.id());
        server.fan_out(|observer| observer.on_closed(channel, cause));
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("listening", &self.is_listening())
            .field("connections", &self.connection_count())
            .finish()
    }
}
