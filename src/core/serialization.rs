//! # Payload Serialization
//!
//! The payload serializer is the collaborator that turns a message body into bytes
//! and back. The wire codec only needs three primitives from it: `encoded_size`,
//! `encode` and `decode`; which concrete encoding backs them is a transport-wide
//! setting that both peers must agree on.
//!
//! ## Formats
//! - **Bincode**: compact binary, default
//! - **JSON**: human-readable, useful while debugging a peer
//! - **MessagePack**: compact binary with self-describing fields
//!
//! ## Usage
//! ```rust
//! use secure_channel::core::serialization::SerializationFormat;
//!
//! let format = SerializationFormat::default();
//! let bytes = format.encode(&("hello", 7u32)).unwrap();
//! let (text, n): (String, u32) = format.decode(&bytes).unwrap();
//! assert_eq!((text.as_str(), n), ("hello", 7));
//! ```

use crate::error::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Supported payload serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
    /// Compact binary format (MessagePack)
    MessagePack,
}

impl SerializationFormat {
    /// Get the format identifier byte
    pub fn format_byte(self) -> u8 {
        match self {
            SerializationFormat::Bincode => 0x01,
            SerializationFormat::Json => 0x02,
            SerializationFormat::MessagePack => 0x03,
        }
    }

    /// Detect format from identifier byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SerializationFormat::Bincode),
            0x02 => Some(SerializationFormat::Json),
            0x03 => Some(SerializationFormat::MessagePack),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }

    /// Number of bytes `encode` will produce for `value`.
    pub fn encoded_size<T: Serialize + ?Sized>(self, value: &T) -> Result<usize> {
        match self {
            SerializationFormat::Bincode => bincode::serialized_size(value)
                .map(|size| size as usize)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            _ => self.encode(value).map(|bytes| bytes.len()),
        }
    }

    /// Serialize a value to bytes
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Bincode => bincode::serialize(value)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::Json => {
                serde_json::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            SerializationFormat::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
        }
    }

    /// Append the serialized value to `out`, avoiding an intermediate buffer for bincode.
    pub fn encode_into<T: Serialize + ?Sized>(self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        match self {
            SerializationFormat::Bincode => bincode::serialize_into(&mut *out, value)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::Json => serde_json::to_writer(&mut *out, value)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::encode::write_named(out, value)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
        }
    }

    /// Deserialize a value from bytes
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Bincode => bincode::deserialize(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::Json => serde_json::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
        }
    }
}
