use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// A Curve25519 key in its 32-byte form, displayed and parsed as the standard
/// printable base64 encoding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Key([u8; 32]);

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key encoding")]
    Encoding(#[from] base64::DecodeError),

    #[error("key must decode to exactly 32 bytes")]
    Length,
}

impl Key {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let bytes = STANDARD.decode(s.trim())?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::Length)?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&self.to_base64()).finish()
    }
}

impl std::str::FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

/// A tunnel identity: a private key and the public half derived from it.
///
/// Only the private key is serialized; peers are configured with the derived
/// public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Keypair {
    private: Key,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            private: Key(secret.to_bytes()),
        }
    }

    pub fn from_private(private: Key) -> Self {
        Self { private }
    }

    pub fn private_key(&self) -> Key {
        self.private
    }

    pub fn public_key(&self) -> Key {
        let secret = StaticSecret::from(self.private.0);
        Key(*PublicKey::from(&secret).as_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only ever show the public half.
        f.debug_struct("Keypair")
            .field("public", &self.public_key())
            .finish()
    }
}

impl std::str::FromStr for Keypair {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::from_base64(s).map(Self::from_private)
    }
}

impl Serialize for Keypair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.private.to_base64())
    }
}

impl<'de> Deserialize<'de> for Keypair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let keypair = Keypair::generate();
        let encoded = keypair.private_key().to_base64();
        let decoded: Keypair = encoded.parse().expect("generated keys must re-parse");
        assert_eq!(keypair, decoded);
        assert_eq!(keypair.public_key(), decoded.public_key());
    }

    #[test]
    fn distinct_keypairs() {
        assert_ne!(Keypair::generate(), Keypair::generate());
    }

    #[test]
    fn public_key_is_not_private_key() {
        let keypair = Keypair::generate();
        assert_ne!(keypair.private_key(), keypair.public_key());
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(Key::from_base64("not base64!").is_err());
        // Valid base64, wrong length.
        assert!(Key::from_base64("c2hvcnQ=").is_err());
    }
}
