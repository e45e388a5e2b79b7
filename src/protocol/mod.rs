//! # Protocol Layer
//!
//! The session handshake and inbound message routing.
//!
//! ## Components
//! - **Message**: the three handshake messages and phase tracking
//! - **Handshake**: pure handshake steps plus async drivers over a frame transport
//! - **Dispatcher**: type-keyed, multi-subscriber handler table
//!
//! ## Handshake
//! ```text
//! WhoAreYou (plaintext) -> WhoIAm (RSA-OAEP) -> Handshake (AES-256-CBC)
//! ```
//! Any failure at any step tears the connection down; there is no retry.

pub mod dispatcher;
pub mod handshake;
pub mod message;
