//! # Channel
//!
//! One secured connection. A channel owns the write half of its stream and,
//! once [`Channel::begin_receive`] is called, a task owns the read half: it
//! runs the handshake, then reads, decrypts and dispatches messages until the
//! connection ends.
//!
//! ## Lifecycle
//! ```text
//! Connecting -> Handshaking -> Ready -> Closed
//!                    \__________________/
//! ```
//! `Closed` is terminal and reached exactly once, with the cause recorded.

use crate::config::{ClientConfig, ServerConfig, TransportConfig};
use crate::core::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::core::message::Message;
use crate::core::registry::MessageRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::{handshake_as_client, handshake_as_server, HandshakeOptions};
use crate::service::observer::ChannelObserver;
use crate::transport::frame::{split, FrameReader, FrameWriter};
use crate::utils::crypto::{CryptorKind, CryptorSlot};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{guarded, with_timeout_error, DEFAULT_TIMEOUT, HANDSHAKE_TIMEOUT};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Where a channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

/// Which side of the handshake a channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issues the RSA key and confirms the session.
    Server,
    /// Picks the session key.
    Client,
}

/// Per-channel limits and shared counters.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub max_frame_size: usize,
    pub handshake_timeout: Duration,
    /// Close after this long without an inbound frame. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    pub send_timeout: Duration,
    pub handshake: HandshakeOptions,
    pub metrics: Arc<Metrics>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_timeout: None,
            send_timeout: DEFAULT_TIMEOUT,
            handshake: HandshakeOptions::default(),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

impl ChannelOptions {
    pub fn for_server(server: &ServerConfig, transport: &TransportConfig) -> Self {
        Self {
            max_frame_size: transport.max_frame_size,
            handshake_timeout: server.handshake_timeout,
            idle_timeout: server.idle_timeout,
            handshake: HandshakeOptions::from(transport),
            ..Self::default()
        }
    }

    pub fn for_client(client: &ClientConfig, transport: &TransportConfig) -> Self {
        Self {
            max_frame_size: transport.max_frame_size,
            handshake_timeout: client.handshake_timeout,
            idle_timeout: client.idle_timeout,
            handshake: HandshakeOptions::from(transport),
            ..Self::default()
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

struct Shared {
    id: Uuid,
    peer: Option<SocketAddr>,
    state: watch::Sender<ChannelState>,
    cryptor: Arc<CryptorSlot>,
    writer: FrameWriter,
    reader: Mutex<Option<FrameReader>>,
    dispatcher: RwLock<Arc<Dispatcher<Channel>>>,
    observers: RwLock<Vec<Arc<dyn ChannelObserver>>>,
    options: ChannelOptions,
    shutdown: CancellationToken,
    close_cause: OnceLock<ProtocolError>,
}

/// Handle to a secured connection. Clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Wrap a connected stream. Nothing is read until
    /// [`begin_receive`](Self::begin_receive).
    pub fn new<S>(
        stream: S,
        peer: Option<SocketAddr>,
        dispatcher: Arc<Dispatcher<Channel>>,
        registry: Arc<MessageRegistry>,
        options: ChannelOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let cryptor = Arc::new(CryptorSlot::new());
        let (reader, writer) = split(
            stream,
            options.max_frame_size,
            registry,
            Arc::clone(&cryptor),
        );
        let (state, _) = watch::channel(ChannelState::Connecting);

        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                peer,
                state,
                cryptor,
                writer,
                reader: Mutex::new(Some(reader)),
                dispatcher: RwLock::new(dispatcher),
                observers: RwLock::new(Vec::new()),
                options,
                shutdown: CancellationToken::new(),
                close_cause: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    /// Why the channel closed, once it has.
    pub fn close_cause(&self) -> Option<ProtocolError> {
        self.shared.close_cause.get().cloned()
    }

    /// The cryptor currently applied to both directions.
    pub fn cryptor_kind(&self) -> CryptorKind {
        self.shared.cryptor.kind()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.options.metrics
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher<Channel>> {
        Arc::clone(
            &self
                .shared
                .dispatcher
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Route messages read from now on through `dispatcher`; returns the one
    /// it replaces. A message already being dispatched finishes on the old one.
    pub fn set_dispatcher(&self, dispatcher: Arc<Dispatcher<Channel>>) -> Arc<Dispatcher<Channel>> {
        let mut current = self
            .shared
            .dispatcher
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, dispatcher)
    }

    /// Add a lifecycle observer. Events that already happened are not replayed.
    pub fn subscribe(&self, observer: Arc<dyn ChannelObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Run the handshake for `role`, then read and dispatch until the channel
    /// closes. Returns the close cause.
    ///
    /// # Errors
    /// `AlreadyReceiving` if the read side was already started; the running
    /// receive loop is unaffected.
    #[instrument(skip_all, fields(channel = %self.shared.id, role = ?role))]
    pub async fn begin_receive(&self, role: Role, cancel: CancellationToken) -> Result<ProtocolError> {
        let mut reader = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ProtocolError::AlreadyReceiving)?;

        let cause = self.receive(&mut reader, role, &cancel).await;
        drop(reader);

        self.finish(cause.clone());
        self.shutdown_writer().await;
        Ok(cause)
    }

    /// Flush and drop the write half so the peer sees the stream end even
    /// while handles to this channel are still alive.
    async fn shutdown_writer(&self) {
        if let Err(e) =
            with_timeout_error(self.shared.writer.shutdown(), self.shared.options.send_timeout).await
        {
            debug!(error = %e, "Writer shutdown failed");
            self.shared.writer.release();
        }
    }

    async fn receive(
        &self,
        reader: &mut FrameReader,
        role: Role,
        cancel: &CancellationToken,
    ) -> ProtocolError {
        let shared = &self.shared;
        let metrics = &shared.options.metrics;

        self.set_state(ChannelState::Handshaking);
        metrics.handshake_attempt();

        let handshake = async {
            match role {
                Role::Server => {
                    handshake_as_server(
                        reader,
                        &shared.writer,
                        &shared.cryptor,
                        &shared.options.handshake,
                    )
                    .await
                }
                Role::Client => {
                    handshake_as_client(
                        reader,
                        &shared.writer,
                        &shared.cryptor,
                        &shared.options.handshake,
                    )
                    .await
                }
            }
        };
        if let Err(e) = self
            .bounded(handshake, Some(shared.options.handshake_timeout), cancel)
            .await
        {
            metrics.handshake_failed();
            warn!(peer = ?shared.peer, error = %e, "Handshake failed");
            return e;
        }

        metrics.handshake_success();
        self.set_state(ChannelState::Ready);
        info!(peer = ?shared.peer, cryptor = %self.cryptor_kind(), "Channel ready");
        self.notify(|observer| observer.on_handshaked(self));

        loop {
            let next = self
                .bounded(reader.next_message(), shared.options.idle_timeout, cancel)
                .await;
            let (envelope, frame_len) = match next {
                Ok(received) => received,
                Err(e) => return e,
            };

            metrics.message_received(frame_len as u64);
            let report = self.dispatcher().dispatch_report(self, &envelope);
            if report.failed > 0 {
                metrics.dispatch_failed(report.failed as u64);
            }
            self.notify(|observer| observer.on_message(self, &envelope));

            tokio::task::yield_now().await;
        }
    }

    /// Bound `fut` by `limit`, the caller's token and this channel's own close.
    async fn bounded<F, T>(
        &self,
        fut: F,
        limit: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = guarded(fut, limit, cancel) => result,
        }
    }

    /// Record the cause, publish `Closed` and tell observers. Only the first
    /// call has any effect.
    fn finish(&self, cause: ProtocolError) {
        if self.shared.close_cause.set(cause.clone()).is_err() {
            return;
        }
        self.shared.shutdown.cancel();

        let metrics = &self.shared.options.metrics;
        match &cause {
            ProtocolError::Timeout => metrics.timeout(),
            ProtocolError::ConnectionClosed | ProtocolError::Cancelled => {}
            e if e.is_protocol() || e.is_handshake() => metrics.protocol_error(),
            _ => metrics.connection_error(),
        }
        if cause.is_graceful_close() || matches!(cause, ProtocolError::Cancelled) {
            info!(peer = ?self.shared.peer, cause = %cause, "Channel closed");
        } else {
            warn!(peer = ?self.shared.peer, cause = %cause, "Channel closed");
        }

        self.set_state(ChannelState::Closed);
        self.notify(|observer| observer.on_closed(self, &cause));
    }

    fn set_state(&self, state: ChannelState) {
        self.shared.state.send_replace(state);
    }

    fn notify(&self, event: impl Fn(&dyn ChannelObserver)) {
        let observers = self
            .shared
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            event(observer.as_ref());
        }
    }

    /// Encrypt and send one message.
    ///
    /// Safe to call from any task; concurrent sends never interleave on the
    /// wire. A failed send is returned to the caller and does not close the
    /// channel; the read side discovers a dead connection on its own.
    ///
    /// # Errors
    /// `NotReady` before the handshake completes or after close.
    pub async fn send<M: Message>(&self, message: &M) -> Result<()> {
        if !self.is_ready() {
            return Err(ProtocolError::NotReady);
        }

        let sent = with_timeout_error(
            self.shared.writer.send(message),
            self.shared.options.send_timeout,
        )
        .await;
        match sent {
            Ok(frame_len) => {
                self.shared.options.metrics.message_sent(frame_len as u64);
                Ok(())
            }
            Err(e) => {
                debug!(channel = %self.shared.id, message_type = M::name(), error = %e, "Send failed");
                Err(e)
            }
        }
    }

    /// Ask the channel to close. The receive loop ends with `ConnectionClosed`.
    ///
    /// A channel whose receive loop never started closes immediately.
    pub fn close(&self) {
        self.shared.shutdown.cancel();

        let idle = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = idle {
            drop(reader);
            self.finish(ProtocolError::ConnectionClosed);
            // Nothing can be sending before the handshake, so the writer is free.
            if !self.shared.writer.release() {
                debug!(channel = %self.shared.id, "Writer busy at close");
            }
        }
    }

    /// Wait until the channel is `Ready`.
    ///
    /// # Errors
    /// The close cause if the channel closes first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.shared.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                ChannelState::Ready => return Ok(()),
                ChannelState::Closed => return Err(self.closed_cause()),
                ChannelState::Connecting | ChannelState::Handshaking => {}
            }
            if state.changed().await.is_err() {
                return Err(self.closed_cause());
            }
        }
    }

    /// Wait until the channel is `Closed` and return the cause.
    pub async fn closed(&self) -> ProtocolError {
        let mut state = self.shared.state.subscribe();
        loop {
            if *state.borrow_and_update() == ChannelState::Closed {
                return self.closed_cause();
            }
            if state.changed().await.is_err() {
                return self.closed_cause();
            }
        }
    }

    fn closed_cause(&self) -> ProtocolError {
        self.close_cause().unwrap_or(ProtocolError::ConnectionClosed)
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish()
    }
}
