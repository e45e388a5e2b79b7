//! RSA-bootstrapped AES session handshake.
//!
//! The server opens with its ephemeral RSA public key in plaintext, the client
//! answers with a fresh AES key sealed under that RSA key, and the server
//! confirms over the new AES session:
//!
//! ```text
//! server                                   client
//!   | -- WhoAreYou{version, pubkey}  (null) --> |
//!   | <-- WhoIAm{version, key, iv}   (rsa) ---- |
//!   | -- Handshake{pubkey}           (aes) ---> |
//! ```
//!
//! Handshake state is per session: each side threads its own
//! `ServerHandshakeState` / `ClientHandshakeState` through the pure step
//! functions, so concurrent handshakes never share anything. The async drivers
//! at the bottom run those steps over a frame transport and move the channel's
//! cryptor forward at each step.

use crate::config::TransportConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{
    check_version, Handshake, HandshakePhase, WhoAreYou, WhoIAm, PROTOCOL_VERSION,
};
use crate::transport::frame::{FrameReader, FrameWriter};
use crate::utils::crypto::{AesCryptor, CryptorSlot, RsaCryptor, DEFAULT_RSA_BITS};
use crate::utils::metrics::Timer;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Parameters both sides need to run a handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Version advertised to the peer.
    pub version: String,
    /// Server keypair size; ignored by clients.
    pub rsa_bits: usize,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            rsa_bits: DEFAULT_RSA_BITS,
        }
    }
}

impl From<&TransportConfig> for HandshakeOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            version: config.protocol_version.clone(),
            rsa_bits: config.rsa_key_bits,
        }
    }
}

/// Server-side handshake state - passed through the handshake flow
pub struct ServerHandshakeState {
    rsa: Arc<RsaCryptor>,
    public_key: String,
    version: String,
    phase: HandshakePhase,
}

impl ServerHandshakeState {
    /// Private-key cryptor the server decodes `WhoIAm` with.
    pub fn cryptor(&self) -> Arc<RsaCryptor> {
        Arc::clone(&self.rsa)
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Mark the handshake complete once `Handshake` has been written.
    pub fn establish(&mut self) -> Result<()> {
        self.phase.advance(HandshakePhase::Established)
    }
}

/// Client-side handshake state - passed through the handshake flow
pub struct ClientHandshakeState {
    rsa: Arc<RsaCryptor>,
    session: AesCryptor,
    server_public_key: String,
    phase: HandshakePhase,
}

impl ClientHandshakeState {
    /// Public-key cryptor the client seals `WhoIAm` with.
    pub fn asymmetric(&self) -> Arc<RsaCryptor> {
        Arc::clone(&self.rsa)
    }

    /// The session cryptor the client proposed.
    pub fn session(&self) -> &AesCryptor {
        &self.session
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }
}

/// Start → ServerHello: generate the ephemeral keypair and the opening message.
///
/// # Errors
/// `HandshakeError` when key generation fails.
pub fn server_hello(options: &HandshakeOptions) -> Result<(ServerHandshakeState, WhoAreYou)> {
    let rsa = RsaCryptor::generate(options.rsa_bits)?;
    let public_key = rsa.public_key_base64()?;

    let mut phase = HandshakePhase::Start;
    phase.advance(HandshakePhase::ServerHello)?;

    let hello = WhoAreYou {
        version: options.version.clone(),
        public_key: public_key.clone(),
    };
    debug!(bits = options.rsa_bits, "Server opening handshake");

    Ok((
        ServerHandshakeState {
            rsa: Arc::new(rsa),
            public_key,
            version: options.version.clone(),
            phase,
        },
        hello,
    ))
}

/// ServerHello → ClientHello: validate the server's opening and propose a
/// session key.
///
/// # Errors
/// `UnsupportedVersion` on a major version mismatch, `HandshakeError` on an
/// unusable public key.
pub fn client_hello(
    hello: &WhoAreYou,
    options: &HandshakeOptions,
) -> Result<(ClientHandshakeState, WhoIAm)> {
    let mut phase = HandshakePhase::Start;
    phase.advance(HandshakePhase::ServerHello)?;

    check_version(&options.version, &hello.version)?;
    let rsa = RsaCryptor::from_public_key_base64(&hello.public_key)?;
    let session = AesCryptor::generate()?;

    let reply = WhoIAm {
        version: options.version.clone(),
        key: session.key_base64(),
        iv: session.iv_base64(),
    };
    phase.advance(HandshakePhase::ClientHello)?;
    debug!(peer_version = %hello.version, "Client proposing session key");

    Ok((
        ClientHandshakeState {
            rsa: Arc::new(rsa),
            session,
            server_public_key: hello.public_key.clone(),
            phase,
        },
        reply,
    ))
}

/// ClientHello → Confirm: accept the client's session key and build the
/// confirmation.
///
/// # Errors
/// `UnsupportedVersion` on a major version mismatch, `HandshakeError` on bad
/// key material or when called out of phase.
pub fn server_confirm(
    state: &mut ServerHandshakeState,
    reply: &WhoIAm,
) -> Result<(AesCryptor, Handshake)> {
    if state.phase != HandshakePhase::ServerHello {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_PHASE_ORDER.into(),
        ));
    }
    check_version(&state.version, &reply.version)?;
    let session = AesCryptor::from_base64(&reply.key, &reply.iv)?;

    state.phase.advance(HandshakePhase::ClientHello)?;
    state.phase.advance(HandshakePhase::Confirm)?;
    debug!(peer_version = %reply.version, "Server accepted session key");

    Ok((
        session,
        Handshake {
            public_key: state.public_key.clone(),
        },
    ))
}

/// Confirm → Established on the client.
///
/// Returns the session cryptor to keep using.
///
/// # Errors
/// `HandshakeError` when the confirmation echoes a different public key or
/// arrives out of phase.
pub fn client_finish(state: &mut ClientHandshakeState, confirm: &Handshake) -> Result<AesCryptor> {
    if state.phase != HandshakePhase::ClientHello {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_PHASE_ORDER.into(),
        ));
    }
    if confirm.public_key != state.server_public_key {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_PUBLIC_KEY_MISMATCH.into(),
        ));
    }

    state.phase.advance(HandshakePhase::Confirm)?;
    state.phase.advance(HandshakePhase::Established)?;
    debug!("Client handshake established");
    Ok(state.session.clone())
}

/// Run the server side of the handshake over a frame transport.
///
/// On success the slot holds the session cryptor.
#[instrument(skip_all, fields(role = "server"))]
pub async fn handshake_as_server(
    reader: &mut FrameReader,
    writer: &FrameWriter,
    slot: &CryptorSlot,
    options: &HandshakeOptions,
) -> Result<()> {
    let _timer = Timer::start("handshake_as_server");

    let keygen = options.clone();
    let (mut state, hello) = tokio::task::spawn_blocking(move || server_hello(&keygen))
        .await
        .map_err(|e| {
            ProtocolError::HandshakeError(format!("{}: {e}", constants::ERR_KEY_GENERATION))
        })??;

    writer.send(&hello).await?;
    slot.advance(state.cryptor())?;

    let reply: WhoIAm = reader.expect().await?;
    let (session, confirm) = server_confirm(&mut state, &reply)?;
    slot.advance(Arc::new(session))?;

    writer.send(&confirm).await?;
    state.establish()?;
    debug!("Server handshake established");
    Ok(())
}

/// Run the client side of the handshake over a frame transport.
///
/// On success the slot holds the session cryptor.
#[instrument(skip_all, fields(role = "client"))]
pub async fn handshake_as_client(
    reader: &mut FrameReader,
    writer: &FrameWriter,
    slot: &CryptorSlot,
    options: &HandshakeOptions,
) -> Result<()> {
    let _timer = Timer::start("handshake_as_client");

    let hello: WhoAreYou = reader.expect().await?;
    let (mut state, reply) = client_hello(&hello, options)?;

    slot.advance(state.asymmetric())?;
    writer.send(&reply).await?;
    slot.advance(Arc::new(state.session().clone()))?;

    let confirm: Handshake = reader.expect().await?;
    client_finish(&mut state, &confirm)?;
    Ok(())
}
