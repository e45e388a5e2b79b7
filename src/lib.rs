//! # Secure Channel
//!
//! Encrypted, message-typed channels over TCP.
//!
//! Every connection starts in plaintext, bootstraps an RSA-OAEP channel from a
//! server-issued public key, then switches both directions to an AES-256-CBC
//! session key chosen by the client. Application messages are plain serde
//! structs tagged with a stable wire id and routed to typed handlers.
//!
//! ## Layers
//! - [`core`]: length-prefixed framing, the type-id codec and payload formats
//! - [`transport`]: encrypted frame reader and writer over any async stream
//! - [`protocol`]: handshake messages, the handshake state machine and the dispatcher
//! - [`service`]: [`Channel`], [`Server`] and [`Client`]
//! - [`utils`]: cryptors, timeouts, logging and metrics
//!
//! ## Example
//! ```no_run
//! use secure_channel::{Channel, Client, Dispatcher, Handler, Message, MessageRegistry, OwnerId};
//! use secure_channel::config::{ClientConfig, LoggingConfig, TransportConfig};
//! use secure_channel::utils::logging::init_logging;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Chat {
//!     text: String,
//! }
//! impl Message for Chat {}
//!
//! # async fn run() -> secure_channel::Result<()> {
//! init_logging(&LoggingConfig::default())?;
//! let registry = Arc::new(MessageRegistry::builder().register::<Chat>()?.build());
//! let dispatcher = Arc::new(Dispatcher::<Channel>::new());
//! dispatcher.add(
//!     OwnerId::STATIC,
//!     &Handler::new(|_: &Channel, chat: &Chat| {
//!         println!("server says: {}", chat.text);
//!         Ok(())
//!     }),
//! )?;
//!
//! let client = Client::new(
//!     &ClientConfig::default(),
//!     &TransportConfig::default(),
//!     dispatcher,
//!     registry,
//! );
//! let channel = client.connect("127.0.0.1", 9000, CancellationToken::new()).await?;
//! channel.send(&Chat { text: "hello".into() }).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::message::{Envelope, Message};
pub use crate::core::registry::MessageRegistry;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::dispatcher::{Dispatcher, Handler, HandlerContainer, HandlerSet, OwnerId};
pub use crate::service::{
    Channel, ChannelEvent, ChannelObserver, ChannelOptions, ChannelState, Client, Role, Server,
};
