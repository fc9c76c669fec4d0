//! Key handling for wgnet
//!
//! WireGuard keys are X25519 keys exchanged as base64 strings. The handshake
//! and transport encryption themselves live in boringtun.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use boringtun::x25519::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Length of every WireGuard key, private, public or preshared
pub const KEY_LEN: usize = 32;

/// X25519 keypair for the local interface
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Build a keypair from a base64 encoded private key
    pub fn from_base64(private_key: &str) -> Result<Self> {
        let secret = StaticSecret::from(decode_key(private_key, "private key")?);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Get the private key as base64 string
    pub fn private_key_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    /// Get the public key as base64 string
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }
}

/// Parse a base64-encoded public key into PublicKey
pub fn parse_public_key(b64: &str) -> Result<PublicKey> {
    Ok(PublicKey::from(decode_key(b64, "public key")?))
}

/// Parse a base64-encoded preshared key
pub fn parse_preshared_key(b64: &str) -> Result<[u8; KEY_LEN]> {
    decode_key(b64, "preshared key")
}

fn decode_key(b64: &str, what: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| Error::InvalidKey(format!("{} is not valid base64: {}", what, e)))?;
    bytes.as_slice().try_into().map_err(|_| {
        Error::InvalidKey(format!(
            "{} has length {} (expected {})",
            what,
            bytes.len(),
            KEY_LEN
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_roundtrip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_base64(&kp.private_key_base64()).unwrap();
        assert_eq!(restored.public_key_base64(), kp.public_key_base64());
    }

    #[test]
    fn test_known_public_key() {
        // Pair generated with a reference X25519 implementation
        let kp = KeyPair::from_base64("6JobtydmzY9h0W4OCdjV5bjxKnEU55wURPNa0YlaIV0=").unwrap();
        assert_eq!(
            kp.public_key_base64(),
            "btM3IkZkGYqT2GjTlL99FriF3E9rPuu1SjPyObXU6m0="
        );
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(matches!(parse_public_key("not base64!"), Err(Error::InvalidKey(_))));
        // 16 bytes
        assert!(matches!(
            parse_public_key("AAAAAAAAAAAAAAAAAAAAAA=="),
            Err(Error::InvalidKey(_))
        ));
        assert!(parse_preshared_key(&BASE64.encode([7u8; KEY_LEN])).is_ok());
    }
}
