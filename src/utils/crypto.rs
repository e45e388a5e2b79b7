//! # Cryptors
//!
//! A cryptor is a stateless `bytes -> bytes` transform applied to every frame
//! body. A channel starts with [`NullCryptor`], switches to [`RsaCryptor`] for the
//! single key-exchange message, and settles on [`AesCryptor`] for the rest of the
//! session. [`CryptorSlot`] holds the current cryptor and only lets it move
//! forward along that order.
//!
//! ## Algorithms
//! - RSA-OAEP with SHA-256, plaintext split into OAEP-sized chunks
//! - AES-256-CBC with PKCS#7 padding, key and IV fixed per session
//!
//! ## Security
//! Symmetric key material is zeroized on drop and never printed by `Debug`.
//! The AES IV is reused for every frame of a session; confidentiality relies on
//! the key being unique per connection.

use crate::error::{constants, ProtocolError, Result};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-256 key length in bytes.
pub const AES_KEY_SIZE: usize = 32;
/// CBC IV length in bytes (one AES block).
pub const AES_IV_SIZE: usize = 16;
/// Default RSA modulus size for the handshake keypair.
pub const DEFAULT_RSA_BITS: usize = 2048;
/// OAEP-SHA256 overhead per block: two digests plus two bytes.
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

/// Cryptor families, ordered by the direction a channel may move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CryptorKind {
    Null,
    Asymmetric,
    Symmetric,
}

impl fmt::Display for CryptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CryptorKind::Null => "null",
            CryptorKind::Asymmetric => "asymmetric",
            CryptorKind::Symmetric => "symmetric",
        };
        f.write_str(name)
    }
}

/// A frame body transform. Implementations hold only immutable key material.
pub trait Cryptor: Send + Sync + fmt::Debug {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
    fn kind(&self) -> CryptorKind;
}

/// Identity transform used before any key exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCryptor;

impl Cryptor for NullCryptor {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }

    fn kind(&self) -> CryptorKind {
        CryptorKind::Null
    }
}

/// RSA-OAEP(SHA-256) cryptor for the key-exchange message.
///
/// The server side owns the private key; the client side is built from the
/// public key it received and can only encode.
pub struct RsaCryptor {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
}

impl RsaCryptor {
    /// Generate a fresh keypair.
    ///
    /// # Errors
    /// `HandshakeError` when the key size is unusable.
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| {
            ProtocolError::HandshakeError(format!("{}: {e}", constants::ERR_KEY_GENERATION))
        })?;
        debug!(bits, "Generated RSA handshake keypair");
        Ok(Self {
            public: RsaPublicKey::from(&private),
            private: Some(private),
        })
    }

    /// Encode-only cryptor from a base64 PKCS#1 DER public key.
    pub fn from_public_key_base64(encoded: &str) -> Result<Self> {
        let der = STANDARD.decode(encoded.trim()).map_err(|_| {
            ProtocolError::HandshakeError(constants::ERR_INVALID_BASE64.into())
        })?;
        let public = RsaPublicKey::from_pkcs1_der(&der).map_err(|_| {
            ProtocolError::HandshakeError(constants::ERR_INVALID_PUBLIC_KEY.into())
        })?;
        Ok(Self {
            public,
            private: None,
        })
    }

    /// Base64 PKCS#1 DER encoding of the public key.
    pub fn public_key_base64(&self) -> Result<String> {
        let der = self.public.to_pkcs1_der().map_err(|_| {
            ProtocolError::HandshakeError(constants::ERR_INVALID_PUBLIC_KEY.into())
        })?;
        Ok(STANDARD.encode(der.as_bytes()))
    }

    pub fn has_private_key(&self) -> bool {
        self.private.is_some()
    }

    /// Modulus size in bytes; every ciphertext block has exactly this length.
    pub fn block_size(&self) -> usize {
        self.public.size()
    }

    /// Largest plaintext chunk a single OAEP block can carry.
    pub fn max_chunk(&self) -> usize {
        self.block_size().saturating_sub(OAEP_SHA256_OVERHEAD)
    }
}

impl fmt::Debug for RsaCryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaCryptor")
            .field("bits", &(self.block_size() * 8))
            .field("private", &self.private.is_some())
            .finish()
    }
}

impl Cryptor for RsaCryptor {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let chunk = self.max_chunk();
        if chunk == 0 {
            return Err(ProtocolError::EncryptionFailure);
        }

        let blocks = plaintext.len().div_ceil(chunk).max(1);
        let mut out = Vec::with_capacity(blocks * self.block_size());
        let mut rng = OsRng;
        // An empty plaintext still produces one block so the frame is never empty.
        let pieces: Vec<&[u8]> = if plaintext.is_empty() {
            vec![plaintext]
        } else {
            plaintext.chunks(chunk).collect()
        };
        for piece in pieces {
            let block = self
                .public
                .encrypt(&mut rng, Oaep::new::<Sha256>(), piece)
                .map_err(|_| ProtocolError::EncryptionFailure)?;
            out.extend_from_slice(&block);
        }
        Ok(out)
    }

    fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let private = self.private.as_ref().ok_or_else(|| {
            warn!("{}", constants::ERR_NO_PRIVATE_KEY);
            ProtocolError::DecryptionFailure
        })?;

        let block = self.block_size();
        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(ProtocolError::DecryptionFailure);
        }

        let mut out = Vec::with_capacity(ciphertext.len());
        for piece in ciphertext.chunks(block) {
            let plain = private
                .decrypt(Oaep::new::<Sha256>(), piece)
                .map_err(|_| ProtocolError::DecryptionFailure)?;
            out.extend_from_slice(&plain);
        }
        Ok(out)
    }

    fn kind(&self) -> CryptorKind {
        CryptorKind::Asymmetric
    }
}

/// AES-256-CBC session cryptor.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AesCryptor {
    key: [u8; AES_KEY_SIZE],
    iv: [u8; AES_IV_SIZE],
}

impl AesCryptor {
    /// Fresh random key and IV from the OS RNG.
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; AES_KEY_SIZE];
        let mut iv = [0u8; AES_IV_SIZE];
        getrandom::fill(&mut key).map_err(|e| {
            ProtocolError::HandshakeError(format!("{}: {e}", constants::ERR_KEY_GENERATION))
        })?;
        getrandom::fill(&mut iv).map_err(|e| {
            ProtocolError::HandshakeError(format!("{}: {e}", constants::ERR_KEY_GENERATION))
        })?;
        let cryptor = Self { key, iv };
        key.zeroize();
        iv.zeroize();
        Ok(cryptor)
    }

    /// Build from raw key and IV bytes.
    ///
    /// # Errors
    /// `HandshakeError` when either has the wrong length.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if key.len() != AES_KEY_SIZE || iv.len() != AES_IV_SIZE {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_INVALID_KEY_LENGTH.into(),
            ));
        }
        let mut cryptor = Self {
            key: [0u8; AES_KEY_SIZE],
            iv: [0u8; AES_IV_SIZE],
        };
        cryptor.key.copy_from_slice(key);
        cryptor.iv.copy_from_slice(iv);
        Ok(cryptor)
    }

    /// Build from the base64 strings carried in the key-exchange message.
    pub fn from_base64(key: &str, iv: &str) -> Result<Self> {
        let invalid = |_| ProtocolError::HandshakeError(constants::ERR_INVALID_BASE64.into());
        let mut key = STANDARD.decode(key).map_err(invalid)?;
        let mut iv = STANDARD.decode(iv).map_err(invalid)?;
        let cryptor = Self::new(&key, &iv);
        key.zeroize();
        iv.zeroize();
        cryptor
    }

    pub fn key_base64(&self) -> String {
        STANDARD.encode(self.key)
    }

    pub fn iv_base64(&self) -> String {
        STANDARD.encode(self.iv)
    }

    /// True when both cryptors hold the same key and IV.
    pub fn same_key(&self, other: &AesCryptor) -> bool {
        self.key == other.key && self.iv == other.iv
    }
}

impl fmt::Debug for AesCryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesCryptor").finish_non_exhaustive()
    }
}

impl Cryptor for AesCryptor {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let encryptor = Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let decryptor = Aes256CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|_| ProtocolError::DecryptionFailure)?;
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }

    fn kind(&self) -> CryptorKind {
        CryptorKind::Symmetric
    }
}

/// The cryptor currently in force on a channel.
///
/// Shared by the reader and writer halves; the cryptor can only be replaced by
/// one of a strictly later [`CryptorKind`].
#[derive(Debug)]
pub struct CryptorSlot {
    current: RwLock<Arc<dyn Cryptor>>,
}

impl Default for CryptorSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptorSlot {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(NullCryptor)),
        }
    }

    pub fn current(&self) -> Arc<dyn Cryptor> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn kind(&self) -> CryptorKind {
        self.current().kind()
    }

    /// Replace the cryptor with one of a later kind.
    ///
    /// # Errors
    /// `CryptorRegression` when `next` is not strictly later than the current one.
    pub fn advance(&self, next: Arc<dyn Cryptor>) -> Result<()> {
        let mut guard = self
            .current
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        let from = guard.kind();
        let to = next.kind();
        if to <= from {
            return Err(ProtocolError::CryptorRegression {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        debug!(%from, %to, "Cryptor advanced");
        *guard = next;
        Ok(())
    }
}
