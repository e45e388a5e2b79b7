//! # Message Registry
//!
//! The registry is the process-wide table that maps wire type ids back to Rust
//! types. It is built once at startup by registering every message type the
//! application exchanges; id collisions between distinct types are reported at
//! that single point, never during a lookup.
//!
//! It is also the wire codec: [`MessageRegistry::serialize`] produces
//! `[type_id: u32 LE][payload]` and [`MessageRegistry::deserialize`] reverses it.
//!
//! ```rust
//! use secure_channel::core::message::Message;
//! use secure_channel::core::registry::MessageRegistry;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Chat { text: String }
//! impl Message for Chat {}
//!
//! let registry = MessageRegistry::builder().register::<Chat>().unwrap().build();
//! let bytes = registry.serialize(&Chat { text: "hi".into() }).unwrap();
//! let envelope = registry.deserialize(&bytes).unwrap();
//! assert_eq!(envelope.downcast_ref::<Chat>().unwrap().text, "hi");
//! ```

use crate::core::message::{Envelope, Message, TYPE_ID_SIZE};
use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{Handshake, WhoAreYou, WhoIAm};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type DecodeFn = fn(&[u8], SerializationFormat) -> Result<Arc<dyn Any + Send + Sync>>;

struct Entry {
    name: &'static str,
    type_id: TypeId,
    decode: DecodeFn,
}

fn decode_as<M: Message>(
    payload: &[u8],
    format: SerializationFormat,
) -> Result<Arc<dyn Any + Send + Sync>> {
    let message: M = format.decode(payload)?;
    Ok(Arc::new(message))
}

/// Builder for a [`MessageRegistry`]; the handshake messages are always present.
pub struct RegistryBuilder {
    entries: HashMap<u32, Entry>,
    format: SerializationFormat,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            entries: HashMap::new(),
            format: SerializationFormat::default(),
        };
        // The three handshake names are fixed constants that cannot collide.
        builder.insert::<WhoAreYou>().ok();
        builder.insert::<WhoIAm>().ok();
        builder.insert::<Handshake>().ok();
        builder
    }

    /// Payload format used for every message in this registry.
    pub fn format(mut self, format: SerializationFormat) -> Self {
        self.format = format;
        self
    }

    /// Register one message type.
    ///
    /// Registering the same type again is a no-op.
    ///
    /// # Errors
    /// Returns `ProtocolError::DuplicateTypeId` when a different type already
    /// owns the same wire id.
    pub fn register<M: Message>(mut self) -> Result<Self> {
        self.insert::<M>()?;
        Ok(self)
    }

    fn insert<M: Message>(&mut self) -> Result<()> {
        let id = M::wire_id();
        if let Some(existing) = self.entries.get(&id) {
            if existing.type_id == TypeId::of::<M>() {
                return Ok(());
            }
            return Err(ProtocolError::DuplicateTypeId {
                id,
                name: M::name(),
                existing: existing.name,
            });
        }

        debug!(id, name = M::name(), "Message type registered");
        self.entries.insert(
            id,
            Entry {
                name: M::name(),
                type_id: TypeId::of::<M>(),
                decode: decode_as::<M>,
            },
        );
        Ok(())
    }

    pub fn build(self) -> MessageRegistry {
        let by_type = self
            .entries
            .iter()
            .map(|(id, entry)| (entry.type_id, *id))
            .collect();
        MessageRegistry {
            entries: self.entries,
            by_type,
            format: self.format,
        }
    }
}

/// Immutable wire-id table and codec shared by every channel.
pub struct MessageRegistry {
    entries: HashMap<u32, Entry>,
    by_type: HashMap<TypeId, u32>,
    format: SerializationFormat,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        RegistryBuilder::new().build()
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.entries.values().map(|entry| entry.name).collect();
        names.sort_unstable();
        f.debug_struct("MessageRegistry")
            .field("format", &self.format)
            .field("types", &names)
            .finish()
    }
}

impl MessageRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains<M: Message>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<M>())
    }

    /// Registered name for a wire id.
    pub fn name_of(&self, id: u32) -> Option<&'static str> {
        self.entries.get(&id).map(|entry| entry.name)
    }

    /// Encode `message` as `[type_id][payload]`.
    ///
    /// # Errors
    /// `UnknownMessageType` when `M` was never registered: the peer could not
    /// decode it either.
    pub fn serialize<M: Message>(&self, message: &M) -> Result<Vec<u8>> {
        let id = M::wire_id();
        if !self.by_type.contains_key(&TypeId::of::<M>()) {
            return Err(ProtocolError::UnknownMessageType(id));
        }

        let size = self.format.encoded_size(message)?;
        let mut buffer = Vec::with_capacity(TYPE_ID_SIZE + size);
        buffer.extend_from_slice(&id.to_le_bytes());
        self.format.encode_into(message, &mut buffer)?;
        Ok(buffer)
    }

    /// Decode `[type_id][payload]` into an envelope.
    ///
    /// # Errors
    /// `InvalidHeader` when fewer than four bytes are present and
    /// `UnknownMessageType` when the id is not in the table.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Envelope> {
        if bytes.len() < TYPE_ID_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        let (id_bytes, payload) = bytes.split_at(TYPE_ID_SIZE);
        let mut raw = [0u8; TYPE_ID_SIZE];
        raw.copy_from_slice(id_bytes);
        let id = u32::from_le_bytes(raw);

        let entry = self
            .entries
            .get(&id)
            .ok_or(ProtocolError::UnknownMessageType(id))?;
        let body = (entry.decode)(payload, self.format)?;
        Ok(Envelope::from_parts(id, entry.type_id, entry.name, body))
    }

    /// Decode and require a specific type.
    pub fn deserialize_as<M: Message + Clone>(&self, bytes: &[u8]) -> Result<M> {
        self.deserialize(bytes)?
            .into_message::<M>()
            .ok_or(ProtocolError::UnexpectedMessage)
    }
}
