//! # Transport Layer
//!
//! Typed, encrypted frame I/O over any `AsyncRead + AsyncWrite` stream. Channels
//! use it over TCP; tests use it over `tokio::io::duplex`.

pub mod frame;

pub use frame::{split, FrameReader, FrameWriter};
