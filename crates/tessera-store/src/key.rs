//! Store key lifecycle: secret material, HKDF key derivation and the key-hash marker.

use crate::codec::b64_encode;
use crate::encryption::EncryptionKey;
use crate::error::StoreError;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_INFO: &[u8] = b"tessera-store-key-v1";

/// Length of secrets produced by [`Secret::generate`].
pub const SECRET_LEN: usize = 32;

/// Raw short-lived secret handed out by a [`crate::secret::SecretSource`].
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl Secret {
    /// Wraps existing secret bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Generates a fresh random secret.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Hash of the derived store key, persisted in cleartext so a connection can
/// tell whether the store was claimed under the same secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyMarker(String);

impl KeyMarker {
    /// Computes the marker for a derived key.
    pub fn of(key: &EncryptionKey) -> Self {
        let digest = Sha256::digest(key.0);
        Self(b64_encode(&digest))
    }

    /// Rebuilds a marker from its stored form.
    pub fn from_stored(bytes: &[u8]) -> Result<Self, StoreError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StoreError::Corrupt(format!("key marker: {}", e)))?;
        Ok(Self(s.to_string()))
    }

    /// Marker as stored in the durable table.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A derived store key paired with its marker.
#[derive(Clone)]
pub struct StoreKey {
    /// The AEAD key used for every record
    pub key: EncryptionKey,
    /// Hash marker of `key`
    pub marker: KeyMarker,
}

impl Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreKey {{ key: [REDACTED], marker: {:?} }}", self.marker)
    }
}

impl StoreKey {
    /// Derives the store key from a secret using HKDF-SHA256.
    pub fn derive(secret: &Secret) -> Result<Self, StoreError> {
        let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(KEY_INFO, &mut okm)
            .map_err(|e| StoreError::EncryptionFailed(format!("HKDF expand failed: {}", e)))?;
        let key = EncryptionKey(okm);
        okm.zeroize();
        let marker = KeyMarker::of(&key);
        Ok(Self { key, marker })
    }
}
