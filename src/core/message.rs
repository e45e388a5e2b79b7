//! # Typed Messages
//!
//! Any `serde` type can travel over a channel once it implements [`Message`]. On
//! the wire a message is identified by a 32-bit id: the xxHash32 of its
//! fully-qualified name. The default name is the Rust type path; override
//! [`Message::name`] when two independently built binaries must agree on ids.
//!
//! Inbound messages are decoded into an [`Envelope`], which carries the id, the
//! concrete Rust type and a shared, type-erased body.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Size of the type id prefix in a serialized message.
pub const TYPE_ID_SIZE: usize = 4;

/// A payload that can be framed, encrypted and dispatched.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fully-qualified name the wire id is derived from.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Wire id of this message type.
    fn wire_id() -> u32 {
        wire_type_id(Self::name())
    }
}

/// Stable 32-bit id of a fully-qualified message name.
#[inline]
pub fn wire_type_id(name: &str) -> u32 {
    xxhash_rust::xxh32::xxh32(name.as_bytes(), 0)
}

/// A decoded inbound message.
#[derive(Clone)]
pub struct Envelope {
    wire_id: u32,
    type_id: TypeId,
    name: &'static str,
    body: Arc<dyn Any + Send + Sync>,
}

impl Envelope {
    /// Wrap an owned message.
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            wire_id: M::wire_id(),
            type_id: TypeId::of::<M>(),
            name: M::name(),
            body: Arc::new(message),
        }
    }

    pub(crate) fn from_parts(
        wire_id: u32,
        type_id: TypeId,
        name: &'static str,
        body: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            wire_id,
            type_id,
            name,
            body,
        }
    }

    pub fn wire_id(&self) -> u32 {
        self.wire_id
    }

    /// Rust type of the body; dispatch matches on this exactly.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<M: Message>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }

    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.body.downcast_ref::<M>()
    }

    /// Type-erased body, as handed to dispatcher callbacks.
    pub fn body(&self) -> &(dyn Any + Send + Sync) {
        &*self.body
    }

    /// Take the body out as `M`, cloning only when the envelope is shared.
    pub fn into_message<M: Message + Clone>(self) -> Option<M> {
        let body = self.body.downcast::<M>().ok()?;
        Some(Arc::try_unwrap(body).unwrap_or_else(|shared| (*shared).clone()))
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("wire_id", &format_args!("{:#010x}", self.wire_id))
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping(u32);
    impl Message for Ping {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Renamed;
    impl Message for Renamed {
        fn name() -> &'static str {
            "chat.Renamed"
        }
    }

    #[test]
    fn test_wire_id_is_stable_hash_of_name() {
        assert_eq!(Ping::wire_id(), wire_type_id(std::any::type_name::<Ping>()));
        assert_eq!(Renamed::wire_id(), wire_type_id("chat.Renamed"));
        assert_eq!(wire_type_id("chat.Renamed"), wire_type_id("chat.Renamed"));
        assert_ne!(Ping::wire_id(), Renamed::wire_id());
    }

    #[test]
    fn test_envelope_downcast() {
        let envelope = Envelope::new(Ping(3));
        assert!(envelope.is::<Ping>());
        assert!(!envelope.is::<Renamed>());
        assert_eq!(envelope.downcast_ref::<Ping>(), Some(&Ping(3)));
        assert!(envelope.downcast_ref::<Renamed>().is_none());
        assert_eq!(envelope.wire_id(), Ping::wire_id());
    }

    #[test]
    fn test_into_message_clones_shared_body() {
        let envelope = Envelope::new(Ping(9));
        let shared = envelope.clone();
        assert_eq!(envelope.into_message::<Ping>(), Some(Ping(9)));
        assert_eq!(shared.into_message::<Ping>(), Some(Ping(9)));
    }
}
