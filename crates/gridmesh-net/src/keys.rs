//! WireGuard key pairs.
//!
//! Keys are Curve25519 (x25519) and travel base64-encoded, the format both
//! the node network workload and `wg-quick` configs use.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{NetError, NetResult};

pub const KEY_LENGTH: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct WgKeyPair {
    private_key: [u8; KEY_LENGTH],
    public_key: [u8; KEY_LENGTH],
}

impl WgKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(&secret)
    }

    pub fn from_private_key(private_key: [u8; KEY_LENGTH]) -> Self {
        Self::from_secret(&StaticSecret::from(private_key))
    }

    pub fn from_private_base64(encoded: &str) -> NetResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| NetError::InvalidKey(e.to_string()))?;
        let private_key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            NetError::InvalidKey(format!("expected {KEY_LENGTH} bytes, got {}", b.len()))
        })?;
        Ok(Self::from_private_key(private_key))
    }

    fn from_secret(secret: &StaticSecret) -> Self {
        Self {
            private_key: secret.to_bytes(),
            public_key: PublicKey::from(secret).to_bytes(),
        }
    }

    pub fn private_base64(&self) -> String {
        STANDARD.encode(self.private_key)
    }

    pub fn public_base64(&self) -> String {
        STANDARD.encode(self.public_key)
    }
}

impl fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_base64())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Public key matching a base64 private key.
pub fn public_key_of(private_base64: &str) -> NetResult<String> {
    Ok(WgKeyPair::from_private_base64(private_base64)?.public_base64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_32_bytes() {
        let pair = WgKeyPair::generate();
        assert_eq!(STANDARD.decode(pair.private_base64()).unwrap().len(), 32);
        assert_eq!(STANDARD.decode(pair.public_base64()).unwrap().len(), 32);
        assert_ne!(pair.private_base64(), pair.public_base64());
    }

    #[test]
    fn public_key_is_derived_deterministically() {
        let pair = WgKeyPair::generate();
        let again = WgKeyPair::from_private_base64(&pair.private_base64()).unwrap();
        assert_eq!(pair, again);
        assert_eq!(public_key_of(&pair.private_base64()).unwrap(), pair.public_base64());
    }

    #[test]
    fn bad_keys_are_rejected() {
        assert!(matches!(
            WgKeyPair::from_private_base64("not base64!"),
            Err(NetError::InvalidKey(_))
        ));
        assert!(matches!(
            WgKeyPair::from_private_base64(&STANDARD.encode([1u8; 16])),
            Err(NetError::InvalidKey(_))
        ));
    }

    #[test]
    fn debug_redacts_private_key() {
        let pair = WgKeyPair::generate();
        let debug = format!("{pair:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&pair.private_base64()));
    }
}
