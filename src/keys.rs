//! Tunnel key material.
//!
//! Keys are X25519 scalars and points encoded as standard padded base64, the
//! same representation `wg genkey` and `wg pubkey` produce. The public key is
//! never trusted on its own: [`KeyPair::from_private`] always re-derives it.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore as _;
use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize as _;

/// Length in bytes of both private and public keys.
pub const KEY_LEN: usize = 32;

/// Errors raised for malformed key material.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KeyError {
    /// Raised when a key is not base64 or does not decode to 32 bytes.
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// Why the key was rejected.
        reason: String,
    },
}

/// Private and public key of one tunnel endpoint, base64 encoded.
#[derive(Clone, Eq, PartialEq)]
pub struct KeyPair {
    private_key: String,
    public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Rebuilds a pair from a stored private key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKey`] when `private_key` is malformed.
    pub fn from_private(private_key: &str) -> Result<Self, KeyError> {
        let public_key = derive_public(private_key)?;
        Ok(Self {
            private_key: private_key.trim().to_owned(),
            public_key,
        })
    }

    /// Base64 private key.
    #[must_use]
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Base64 public key.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

/// Generates a fresh clamped key pair from the OS random source.
#[must_use]
pub fn generate() -> KeyPair {
    let mut bytes = [0_u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    clamp(&mut bytes);

    let private_key = STANDARD.encode(bytes);
    let secret = StaticSecret::from(bytes);
    bytes.zeroize();
    let public_key = STANDARD.encode(PublicKey::from(&secret).as_bytes());

    KeyPair {
        private_key,
        public_key,
    }
}

/// Derives the base64 public key for a base64 private key.
///
/// # Errors
///
/// Returns [`KeyError::InvalidKey`] when the input is not base64 or does not
/// decode to exactly 32 bytes.
pub fn derive_public(private_key: &str) -> Result<String, KeyError> {
    let mut bytes = decode_key(private_key)?;
    let secret = StaticSecret::from(bytes);
    bytes.zeroize();
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

/// Checks that `key` is well-formed base64 of the correct length. Used for
/// both private and public keys.
///
/// # Errors
///
/// Returns [`KeyError::InvalidKey`] describing the defect.
pub fn validate(key: &str) -> Result<(), KeyError> {
    let mut bytes = decode_key(key)?;
    bytes.zeroize();
    Ok(())
}

fn decode_key(key: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(KeyError::InvalidKey {
            reason: String::from("key is empty"),
        });
    }

    let mut decoded = STANDARD
        .decode(trimmed)
        .map_err(|err| KeyError::InvalidKey {
            reason: format!("not valid base64: {err}"),
        })?;
    let result = <[u8; KEY_LEN]>::try_from(decoded.as_slice()).map_err(|_| KeyError::InvalidKey {
        reason: format!("decoded to {} bytes, expected {KEY_LEN}", decoded.len()),
    });
    decoded.zeroize();
    result
}

/// Applies the Curve25519 scalar clamping used by WireGuard private keys.
fn clamp(bytes: &mut [u8; KEY_LEN]) {
    bytes[0] &= 248;
    bytes[KEY_LEN - 1] &= 127;
    bytes[KEY_LEN - 1] |= 64;
}
