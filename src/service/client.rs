//! # Client
//!
//! Opens one client-role [`Channel`] at a time and waits for its handshake.

use crate::config::{ClientConfig, TransportConfig};
use crate::core::message::Message;
use crate::core::registry::MessageRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::service::channel::{Channel, ChannelOptions, ChannelState, Role};
use crate::service::observer::ChannelObserver;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::guarded;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub struct Client {
    config: ClientConfig,
    options: ChannelOptions,
    dispatcher: Arc<Dispatcher<Channel>>,
    registry: Arc<MessageRegistry>,
    channel: Mutex<Option<Channel>>,
    connecting: tokio::sync::Mutex<()>,
    observers: RwLock<Vec<Arc<dyn ChannelObserver>>>,
}

impl Client {
    pub fn new(
        config: &ClientConfig,
        transport: &TransportConfig,
        dispatcher: Arc<Dispatcher<Channel>>,
        registry: Arc<MessageRegistry>,
    ) -> Self {
        Self {
            config: config.clone(),
            options: ChannelOptions::for_client(config, transport),
            dispatcher,
            registry,
            channel: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Connect to `host:port` and complete the handshake.
    ///
    /// The TCP connect is bounded by the configured connection timeout and the
    /// handshake by the handshake timeout. `cancel` also ends the channel later.
    ///
    /// # Errors
    /// `AlreadyConnected` while a previous channel is still open, `Timeout`,
    /// `Cancelled`, an I/O error, or whatever closed the channel during the
    /// handshake.
    pub async fn connect(&self, host: &str, port: u16, cancel: CancellationToken) -> Result<Channel> {
        self.connect_to(&format!("{host}:{port}"), cancel).await
    }

    /// Connect to the configured default address.
    pub async fn connect_default(&self, cancel: CancellationToken) -> Result<Channel> {
        let address = self.config.address.clone();
        self.connect_to(&address, cancel).await
    }

    /// Build a client around a socket connected elsewhere and run the
    /// handshake on it. Observers subscribed afterwards see later channels
    /// only.
    ///
    /// # Errors
    /// Whatever closed the channel during the handshake.
    pub async fn from_stream(
        stream: TcpStream,
        config: &ClientConfig,
        transport: &TransportConfig,
        dispatcher: Arc<Dispatcher<Channel>>,
        registry: Arc<MessageRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let client = Self::new(config, transport, dispatcher, registry);
        client.adopt(stream, cancel).await?;
        Ok(client)
    }

    /// Handshake over an already connected socket and make it the current
    /// channel.
    ///
    /// # Errors
    /// `AlreadyConnected` while a previous channel is still open, or whatever
    /// closed the channel during the handshake.
    pub async fn adopt(&self, stream: TcpStream, cancel: CancellationToken) -> Result<Channel> {
        let _connecting = self.connecting.lock().await;
        self.ensure_idle()?;
        self.attach(stream, cancel).await
    }

    fn ensure_idle(&self) -> Result<()> {
        if self
            .channel()
            .is_some_and(|channel| channel.state() != ChannelState::Closed)
        {
            return Err(ProtocolError::AlreadyConnected);
        }
        Ok(())
    }

    #[instrument(skip(self, cancel))]
    async fn connect_to(&self, address: &str, cancel: CancellationToken) -> Result<Channel> {
        let _connecting = self.connecting.lock().await;
        self.ensure_idle()?;

        let stream = guarded(
            async { TcpStream::connect(address).await.map_err(ProtocolError::from) },
            Some(self.config.connection_timeout),
            &cancel,
        )
        .await?;
        self.attach(stream, cancel).await
    }

    async fn attach(&self, stream: TcpStream, cancel: CancellationToken) -> Result<Channel> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let peer = stream.peer_addr().ok();
        self.options.metrics.connection_established();

        let channel = Channel::new(
            stream,
            peer,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.registry),
            self.options.clone(),
        );
        for observer in self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            channel.subscribe(Arc::clone(observer));
        }
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());

        let receiver = channel.clone();
        let metrics = Arc::clone(&self.options.metrics);
        tokio::spawn(async move {
            let _ = receiver.begin_receive(Role::Client, cancel).await;
            metrics.connection_closed();
        });

        channel.wait_ready().await?;
        info!(peer = ?peer, "Connected");
        Ok(channel)
    }

    pub fn is_connected(&self) -> bool {
        self.channel().is_some_and(|channel| channel.is_ready())
    }

    /// Send on the current channel.
    ///
    /// # Errors
    /// `NotReady` when there is no ready channel.
    pub async fn send<M: Message>(&self, message: &M) -> Result<()> {
        match self.channel() {
            Some(channel) => channel.send(message).await,
            None => Err(ProtocolError::NotReady),
        }
    }

    /// Close the current channel, if any.
    pub fn close(&self) {
        if let Some(channel) = self.channel() {
            channel.close();
        }
    }

    /// Observe every channel opened from now on.
    pub fn subscribe(&self, observer: Arc<dyn ChannelObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// The most recent channel, open or not.
    pub fn channel(&self) -> Option<Channel> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.options.metrics)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.config.address)
            .field("channel", &self.channel())
            .finish()
    }
}
