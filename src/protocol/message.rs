//! Handshake message types and phase tracking.
//!
//! The three bootstrap messages carry fixed wire names so that every build of the
//! crate agrees on their ids regardless of module paths.

use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Version string every peer advertises during the handshake.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Server → client, plaintext: the server's ephemeral RSA public key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WhoAreYou {
    pub version: String,
    /// Base64 PKCS#1 DER public key.
    pub public_key: String,
}

impl Message for WhoAreYou {
    fn name() -> &'static str {
        "handshake.WhoAreYou"
    }
}

/// Client → server, RSA-encrypted: the session AES key and IV.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WhoIAm {
    pub version: String,
    pub key: String,
    pub iv: String,
}

impl Message for WhoIAm {
    fn name() -> &'static str {
        "handshake.WhoIAm"
    }
}

/// Server → client, AES-encrypted: confirms the session key works.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Handshake {
    pub public_key: String,
}

impl Message for Handshake {
    fn name() -> &'static str {
        "handshake.Handshake"
    }
}

/// Handshake progress; each step may only move to the next phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakePhase {
    Start,
    ServerHello,
    ClientHello,
    Confirm,
    Established,
}

impl HandshakePhase {
    pub fn next(self) -> Option<HandshakePhase> {
        match self {
            HandshakePhase::Start => Some(HandshakePhase::ServerHello),
            HandshakePhase::ServerHello => Some(HandshakePhase::ClientHello),
            HandshakePhase::ClientHello => Some(HandshakePhase::Confirm),
            HandshakePhase::Confirm => Some(HandshakePhase::Established),
            HandshakePhase::Established => None,
        }
    }

    /// Advance to `to`, rejecting skips and regressions.
    pub fn advance(&mut self, to: HandshakePhase) -> Result<()> {
        if self.next() != Some(to) {
            return Err(ProtocolError::HandshakeError(format!(
                "{}: {:?} -> {:?}",
                constants::ERR_PHASE_ORDER,
                self,
                to
            )));
        }
        *self = to;
        Ok(())
    }
}

/// Major component of a dotted version string.
pub fn major_version(version: &str) -> Option<u64> {
    version.trim().split('.').next()?.trim().parse().ok()
}

/// Accept a peer version whose major component matches `local`.
pub fn check_version(local: &str, peer: &str) -> Result<()> {
    match (major_version(local), major_version(peer)) {
        (Some(ours), Some(theirs)) if ours == theirs => Ok(()),
        _ => Err(ProtocolError::UnsupportedVersion(peer.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_advances_in_order() {
        let mut phase = HandshakePhase::Start;
        for to in [
            HandshakePhase::ServerHello,
            HandshakePhase::ClientHello,
            HandshakePhase::Confirm,
            HandshakePhase::Established,
        ] {
            assert!(phase.advance(to).is_ok());
        }
        assert_eq!(phase, HandshakePhase::Established);
        assert!(phase.next().is_none());
    }

    #[test]
    fn test_phase_rejects_skip_and_revisit() {
        let mut phase = HandshakePhase::Start;
        assert!(phase.advance(HandshakePhase::ClientHello).is_err());
        assert_eq!(phase, HandshakePhase::Start);

        phase = HandshakePhase::Confirm;
        assert!(phase.advance(HandshakePhase::ServerHello).is_err());
        assert!(phase.advance(HandshakePhase::Confirm).is_err());
    }

    #[test]
    fn test_version_major_must_match() {
        assert!(check_version(PROTOCOL_VERSION, "1.0.0").is_ok());
        assert!(check_version(PROTOCOL_VERSION, "1.7.3").is_ok());
        assert!(check_version(PROTOCOL_VERSION, "1").is_ok());
        assert!(matches!(
            check_version(PROTOCOL_VERSION, "2.0.0"),
            Err(ProtocolError::UnsupportedVersion(_))
        ));
        assert!(check_version(PROTOCOL_VERSION, "").is_err());
        assert!(check_version(PROTOCOL_VERSION, "banana").is_err());
        assert!(check_version("2.1", "2.0.0").is_ok());
    }

    #[test]
    fn test_fixed_wire_names() {
        assert_eq!(WhoAreYou::name(), "handshake.WhoAreYou");
        assert_ne!(WhoAreYou::wire_id(), WhoIAm::wire_id());
        assert_ne!(WhoIAm::wire_id(), Handshake::wire_id());
    }
}
