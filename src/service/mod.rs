//! # Service Layer
//!
//! Connection-level API: secured channels and the TCP server and client that
//! produce them.
//!
//! ## Components
//! - **Channel**: handshake, encrypted send, receive loop and close
//! - **Server**: accept loop, connection limit, active set and broadcast
//! - **Client**: single outbound channel with connect timeout
//! - **Observer**: lifecycle callbacks and an event stream adapter

pub mod channel;
pub mod client;
pub mod observer;
pub mod server;

pub use channel::{Channel, ChannelOptions, ChannelState, Role};
pub use client::Client;
pub use observer::{event_stream, ChannelEvent, ChannelObserver};
pub use server::Server;
