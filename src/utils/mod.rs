//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, metrics and timing.
//!
//! ## Components
//! - **Crypto**: Null, RSA-OAEP and AES-256-CBC cryptors plus the monotonic slot
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Async timeout and cancellation wrappers
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom, OsRng)
//! - Memory zeroing for symmetric key material (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use crypto::{AesCryptor, Cryptor, CryptorKind, CryptorSlot, NullCryptor, RsaCryptor};
pub use metrics::{Metrics, MetricsSnapshot};
