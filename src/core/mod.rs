//! # Core Protocol Components
//!
//! Framing, the type-id wire codec and payload serialization.
//!
//! ## Components
//! - **Codec**: Tokio codec cutting a byte stream into length-prefixed frames
//! - **Message**: the `Message` trait and decoded `Envelope`
//! - **Registry**: wire id table, built once at startup
//! - **Serialization**: selectable payload encodings
//!
//! ## Wire Format
//! ```text
//! frame      := [Length: i32 LE (4)] [Ciphertext (Length)]
//! ciphertext := cryptor.encode([TypeId: u32 LE (4)] [Payload (N)])
//! ```
//!
//! ## Security
//! - Maximum frame size: 20 KiB by default (bounds allocation per peer)
//! - Length validation before allocation
//! - Unknown type ids are fatal for the read that hit them

pub mod codec;
pub mod message;
pub mod registry;
pub mod serialization;
