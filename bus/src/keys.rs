//! x25519 identity keys.
//!
//! Every bus instance is identified by a 32-byte x25519 public key. Service
//! nodes supply their long-term keypair at construction; other instances get
//! an ephemeral keypair generated here. The secret half is zeroed on drop.

use std::fmt;

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::ConfigError;

/// A 32-byte x25519 public key identifying a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubKey([u8; 32]);

impl PubKey {
    /// Key length in bytes.
    pub const LEN: usize = 32;

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Wrap a byte slice, returning `None` unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({}…)", hex::encode(&self.0[..4]))
    }
}

/// The x25519 keypair of a bus instance.
pub struct Keypair {
    secret: Zeroizing<StaticSecret>,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Zeroizing::new(secret),
            public,
        }
    }

    /// Reconstruct a keypair from raw bytes, checking that the halves match.
    pub fn from_bytes(pubkey: [u8; 32], seckey: [u8; 32]) -> Result<Self, ConfigError> {
        let secret = StaticSecret::from(seckey);
        let public = PublicKey::from(&secret);
        if public.as_bytes() != &pubkey {
            return Err(ConfigError::KeyMismatch);
        }
        Ok(Self {
            secret: Zeroizing::new(secret),
            public,
        })
    }

    /// The public half.
    pub fn public(&self) -> PubKey {
        PubKey(*self.public.as_bytes())
    }

    /// The secret half, zeroed when the returned guard drops.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_distinct() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.public(), b.public());
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let original = Keypair::generate();
        let restored =
            Keypair::from_bytes(*original.public().as_bytes(), *original.secret_bytes()).unwrap();
        assert_eq!(restored.public(), original.public());
    }

    #[test]
    fn test_mismatched_halves_rejected() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let result = Keypair::from_bytes(*a.public().as_bytes(), *b.secret_bytes());
        assert!(matches!(result, Err(ConfigError::KeyMismatch)));
    }

    #[test]
    fn test_pubkey_from_slice() {
        assert!(PubKey::from_slice(&[0u8; 31]).is_none());
        assert!(PubKey::from_slice(&[0u8; 32]).is_some());
    }
}
