//! Property-based tests using proptest
//!
//! These tests validate wire invariants across randomly generated inputs:
//! framing survives any split of the byte stream, cryptors never panic on
//! hostile input, and the registry only accepts what it knows.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use proptest::prelude::*;
use secure_channel::core::codec::{FrameCodec, LENGTH_PREFIX_SIZE};
use secure_channel::utils::crypto::{AesCryptor, Cryptor, AES_IV_SIZE};
use secure_channel::{Message, MessageRegistry, ProtocolError};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    id: u64,
    body: String,
    tags: Vec<String>,
}
impl Message for Note {}

const MAX_FRAME: usize = 4096;

// Property: a stream of frames decodes to the same frames however it is split
proptest! {
    #[test]
    fn prop_frames_survive_arbitrary_splits(
        frames in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..16),
        cuts in prop::collection::vec(1usize..64, 1..64),
    ) {
        let mut codec = FrameCodec::new(MAX_FRAME);
        let mut wire = BytesMut::new();
        for frame in &frames {
            Encoder::<&[u8]>::encode(&mut codec, frame.as_slice(), &mut wire).expect("encode");
        }
        let wire = wire.freeze();

        let mut buffer = BytesMut::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut cut = cuts.iter().cycle();
        while offset < wire.len() {
            let step = (*cut.next().unwrap()).min(wire.len() - offset);
            buffer.extend_from_slice(&wire[offset..offset + step]);
            offset += step;
            while let Some(frame) = codec.decode(&mut buffer).expect("decode") {
                decoded.push(frame.to_vec());
            }
        }

        prop_assert!(buffer.is_empty());
        prop_assert_eq!(decoded, frames);
    }
}

// Property: any length prefix above the limit is rejected before buffering
proptest! {
    #[test]
    fn prop_oversized_prefix_rejected(len in (MAX_FRAME as i32 + 1)..i32::MAX) {
        let mut codec = FrameCodec::new(MAX_FRAME);
        let mut buffer = BytesMut::from(&len.to_le_bytes()[..]);
        let result = codec.decode(&mut buffer);
        prop_assert!(matches!(result, Err(ProtocolError::OversizedPacket(n)) if n == len as usize));
        prop_assert_eq!(buffer.len(), LENGTH_PREFIX_SIZE);
    }
}

// Property: AES-CBC output is block aligned, strictly longer, and reversible
proptest! {
    #[test]
    fn prop_aes_sealing_shape(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let aes = AesCryptor::generate().expect("keygen");
        let sealed = aes.encode(&data).expect("encode");

        prop_assert_eq!(sealed.len() % AES_IV_SIZE, 0);
        prop_assert!(sealed.len() > data.len());
        prop_assert!(sealed.len() <= data.len() + AES_IV_SIZE);
        prop_assert_eq!(aes.decode(&sealed).expect("decode"), data);
    }
}

// Property: decoding hostile bytes returns an error or data, never panics
proptest! {
    #[test]
    fn prop_aes_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..1024)) {
        let aes = AesCryptor::generate().expect("keygen");
        let _ = aes.decode(&data);
    }
}

// Property: the registry rejects payloads whose type id it does not know
proptest! {
    #[test]
    fn prop_registry_rejects_unknown_ids(
        id in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let registry = MessageRegistry::builder().register::<Note>().unwrap().build();
        prop_assume!(registry.name_of(id).is_none());

        let mut bytes = id.to_le_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        prop_assert!(matches!(
            registry.deserialize(&bytes),
            Err(ProtocolError::UnknownMessageType(got)) if got == id
        ));
    }
}

// Property: registered messages survive the registry unchanged
proptest! {
    #[test]
    fn prop_registry_preserves_messages(
        id in any::<u64>(),
        body in ".{0,200}",
        tags in prop::collection::vec("[a-z]{1,12}", 0..8),
    ) {
        let registry = MessageRegistry::builder().register::<Note>().unwrap().build();
        let note = Note { id, body, tags };

        let bytes = registry.serialize(&note).expect("serialize");
        prop_assert_eq!(&bytes[..4], &Note::wire_id().to_le_bytes()[..]);
        let back: Note = registry.deserialize_as(&bytes).expect("deserialize");
        prop_assert_eq!(back, note);
    }
}
