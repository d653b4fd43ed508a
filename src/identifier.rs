//! 160-bit resource identifiers.
//!
//! Every addressable thing in the network — a user, a file, a per-user
//! transaction log — is named by a fixed 20-byte SHA-1 digest over some
//! canonical byte form. This module owns the derivation rules and the
//! canonical public-key encoder; nothing else should hash bytes into an
//! `Identifier` directly.

use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

pub const IDENTIFIER_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum IdentifierError {
    #[error("failed to encode public key: {0}")]
    KeyEncode(String),
}

/// A 160-bit opaque identifier. Compares and hashes by its raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(pub [u8; IDENTIFIER_LEN]);

impl Identifier {
    pub fn from_bytes(bytes: [u8; IDENTIFIER_LEN]) -> Self {
        Identifier(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentifierError> {
        let bytes = hex::decode(s).map_err(|e| IdentifierError::KeyEncode(e.to_string()))?;
        let arr: [u8; IDENTIFIER_LEN] = bytes
            .try_into()
            .map_err(|_| IdentifierError::KeyEncode("identifier must be 20 bytes".into()))?;
        Ok(Identifier(arr))
    }

    fn sha1(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; IDENTIFIER_LEN];
        bytes.copy_from_slice(&digest);
        Identifier(bytes)
    }

    /// SHA-1 of an arbitrary already-canonical byte form (e.g. a DER-encoded
    /// public key received over the wire as `Node::public_key_der`, where no
    /// `RsaPublicKey` value is available to hash via `user_id`).
    pub fn sha1_of(data: &[u8]) -> Self {
        Self::sha1(data)
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Canonical byte encoding of an RSA public key, used everywhere a public key
/// is turned into an `Identifier`. The PKCS#1 DER encoding of the public key
/// is stable and deterministic for a given modulus/exponent pair; whichever
/// encoder is chosen, it must be used consistently everywhere or user ids
/// will diverge between peers.
pub fn gob_encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>, IdentifierError> {
    key.to_pkcs1_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| IdentifierError::KeyEncode(e.to_string()))
}

/// `user_id = SHA-1(gob_encode(public_key))`
pub fn user_id(key: &RsaPublicKey) -> Result<Identifier, IdentifierError> {
    let encoded = gob_encode_public_key(key)?;
    Ok(Identifier::sha1(&encoded))
}

/// `resource_id(path) = SHA-1(utf8(path))`
pub fn resource_id(path: &str) -> Identifier {
    Identifier::sha1(path.as_bytes())
}

/// `txlog_id(user) = SHA-1(gob_encode(user.public_key) || "-transaction-log")`
pub fn txlog_id(key: &RsaPublicKey) -> Result<Identifier, IdentifierError> {
    let mut bytes = gob_encode_public_key(key)?;
    bytes.extend_from_slice(b"-transaction-log");
    Ok(Identifier::sha1(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::{RsaPrivateKey, RsaPublicKey};

    fn test_key() -> RsaPublicKey {
        let priv_key = RsaPrivateKey::new(&mut rand::thread_rng(), 512).unwrap();
        RsaPublicKey::from(&priv_key)
    }

    #[test]
    fn resource_id_is_stable() {
        let a = resource_id("notes/todo.txt");
        let b = resource_id("notes/todo.txt");
        assert_eq!(a, b);
    }

    #[test]
    fn resource_id_differs_by_path() {
        assert_ne!(resource_id("a.txt"), resource_id("b.txt"));
    }

    #[test]
    fn user_id_is_stable_for_same_key() {
        let key = test_key();
        let a = user_id(&key).unwrap();
        let b = user_id(&key).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn txlog_id_differs_from_user_id() {
        let key = test_key();
        let uid = user_id(&key).unwrap();
        let tid = txlog_id(&key).unwrap();
        assert_ne!(uid, tid);
    }

    #[test]
    fn hex_roundtrip() {
        let id = resource_id("round/trip");
        let hex = id.to_hex();
        let back = Identifier::from_hex(&hex).unwrap();
        assert_eq!(id, back);
    }
}
