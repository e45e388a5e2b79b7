//! # Error Types
//!
//! Error handling for the secure channel protocol.
//!
//! Every fault a channel can hit is a [`ProtocolError`]. Transport, protocol and
//! handshake faults are terminal for the affected channel and surface exactly once
//! as the cause of its `Closed` event; API misuse (sending before the handshake,
//! registering a handler twice) is returned directly to the caller.
//!
//! ## Error Categories
//! - **Transport**: I/O failures, peer close, timeouts, cancellation
//! - **Protocol**: oversized frames, malformed headers, unknown message types
//! - **Handshake**: decryption failures, version mismatches, out-of-phase messages
//! - **State / API**: not ready, duplicate handlers, duplicate type ids
//!
//! ## Example Usage
//! ```rust
//! use secure_channel::error::{ProtocolError, Result};
//!
//! fn frame_len(header: [u8; 4]) -> Result<usize> {
//!     let len = i32::from_le_bytes(header);
//!     usize::try_from(len).map_err(|_| ProtocolError::InvalidHeader)
//! }
//!
//! assert!(frame_len((-1i32).to_le_bytes()).is_err());
//! assert_eq!(frame_len(16i32.to_le_bytes()).unwrap(), 16);
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_CLOSED_MID_FRAME: &str = "Connection closed in the middle of a frame";

    /// Framing errors
    pub const ERR_NEGATIVE_LENGTH: &str = "Frame length header is negative";

    /// Cryptographic errors
    pub const ERR_NO_PRIVATE_KEY: &str = "RSA cryptor has no private key";
    pub const ERR_INVALID_PUBLIC_KEY: &str = "Invalid RSA public key";
    pub const ERR_INVALID_KEY_LENGTH: &str = "Invalid symmetric key or IV length";
    pub const ERR_INVALID_BASE64: &str = "Invalid base64 key material";
    pub const ERR_KEY_GENERATION: &str = "Key generation failed";

    /// Handshake errors
    pub const ERR_PHASE_ORDER: &str = "Handshake phase out of order";
    pub const ERR_PUBLIC_KEY_MISMATCH: &str = "Handshake confirmation carries a different public key";

    /// Lock errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// Primary error type for all protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Frame too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Unknown message type id: {0:#010x}")]
    UnknownMessageType(u32),

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Channel is not ready")]
    NotReady,

    #[error("Channel already has an active reader")]
    AlreadyReceiving,

    #[error("Client already owns a live channel")]
    AlreadyConnected,

    #[error("Cryptor transition from {from} to {to} would regress")]
    CryptorRegression { from: String, to: String },

    #[error("Handler already registered for {0}")]
    DuplicateHandler(&'static str),

    #[error("Handler container exposes no handlers")]
    EmptyContainer,

    #[error("Type id {id:#010x} of {name} collides with {existing}")]
    DuplicateTypeId {
        id: u32,
        name: &'static str,
        existing: &'static str,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Socket-level faults: resets, peer close, timeouts, cancellation.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::TransportError(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::Timeout
                | ProtocolError::Cancelled
        )
    }

    /// Faults caused by bytes on the wire that violate the framing or type table.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidHeader
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::UnknownMessageType(_)
                | ProtocolError::UnexpectedMessage
                | ProtocolError::SerializeError(_)
                | ProtocolError::DeserializeError(_)
        )
    }

    /// Faults raised while bootstrapping the session key.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            ProtocolError::HandshakeError(_)
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::DecryptionFailure
                | ProtocolError::EncryptionFailure
                | ProtocolError::CryptorRegression { .. }
        )
    }

    /// A graceful close by either side rather than a fault.
    pub fn is_graceful_close(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed)
    }
}

// Close causes are handed to every observer and waiter, so errors must be
// copyable even though `io::Error` is not `Clone`.
impl Clone for ProtocolError {
    fn clone(&self) -> Self {
        match self {
            ProtocolError::Io(e) => ProtocolError::Io(io::Error::new(e.kind(), e.to_string())),
            ProtocolError::SerializeError(s) => ProtocolError::SerializeError(s.clone()),
            ProtocolError::DeserializeError(s) => ProtocolError::DeserializeError(s.clone()),
            ProtocolError::TransportError(s) => ProtocolError::TransportError(s.clone()),
            ProtocolError::ConnectionClosed => ProtocolError::ConnectionClosed,
            ProtocolError::InvalidHeader => ProtocolError::InvalidHeader,
            ProtocolError::OversizedPacket(n) => ProtocolError::OversizedPacket(*n),
            ProtocolError::UnknownMessageType(id) => ProtocolError::UnknownMessageType(*id),
            ProtocolError::UnexpectedMessage => ProtocolError::UnexpectedMessage,
            ProtocolError::DecryptionFailure => ProtocolError::DecryptionFailure,
            ProtocolError::EncryptionFailure => ProtocolError::EncryptionFailure,
            ProtocolError::HandshakeError(s) => ProtocolError::HandshakeError(s.clone()),
            ProtocolError::UnsupportedVersion(s) => ProtocolError::UnsupportedVersion(s.clone()),
            ProtocolError::Timeout => ProtocolError::Timeout,
            ProtocolError::Cancelled => ProtocolError::Cancelled,
            ProtocolError::NotReady => ProtocolError::NotReady,
            ProtocolError::AlreadyReceiving => ProtocolError::AlreadyReceiving,
            ProtocolError::AlreadyConnected => ProtocolError::AlreadyConnected,
            ProtocolError::CryptorRegression { from, to } => ProtocolError::CryptorRegression {
                from: from.clone(),
                to: to.clone(),
            },
            ProtocolError::DuplicateHandler(name) => ProtocolError::DuplicateHandler(name),
            ProtocolError::EmptyContainer => ProtocolError::EmptyContainer,
            ProtocolError::DuplicateTypeId { id, name, existing } => {
                ProtocolError::DuplicateTypeId {
                    id: *id,
                    name,
                    existing,
                }
            }
            ProtocolError::ConfigError(s) => ProtocolError::ConfigError(s.clone()),
            ProtocolError::Custom(s) => ProtocolError::Custom(s.clone()),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
