//! AES-256-GCM and ChaCha20-Poly1305 AEAD sealing for store records

use crate::error::StoreError;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// 96-bit (12-byte) nonce for AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub [u8; 12]);

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[default]
    #[serde(rename = "aes-gcm-256")]
    AesGcm256,
    /// ChaCha20-Poly1305, fast on hardware without AES instructions
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

/// The at-rest form of every record: ciphertext (with 16-byte auth tag), nonce, algorithm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedRecord {
    /// Algorithm (needed for decryption)
    pub algo: EncryptionAlgorithm,
    /// Nonce used for this encryption operation
    pub nonce: Nonce,
    /// Ciphertext with 16-byte AEAD authentication tag appended
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl SealedRecord {
    /// Encode the envelope for the durable table
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode an envelope read back from the durable table
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

/// Generate a cryptographically random 12-byte nonce
pub fn random_nonce() -> Nonce {
    use rand::RngCore;
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    Nonce(bytes)
}

/// Encrypt plaintext under `nonce`, binding `aad` (the record's key id) into the tag.
pub fn seal_with_nonce(
    plaintext: &[u8],
    aad: &[u8],
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
    nonce: Nonce,
) -> Result<SealedRecord, StoreError> {
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let ciphertext = match algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            let n = aes_gcm::Nonce::from_slice(&nonce.0);
            cipher
                .encrypt(n, payload)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            let n = chacha20poly1305::Nonce::from_slice(&nonce.0);
            cipher
                .encrypt(n, payload)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?
        }
    };
    Ok(SealedRecord {
        algo,
        nonce,
        ciphertext,
    })
}

/// Encrypt plaintext. A random nonce is generated and stored in the result.
pub fn seal(
    plaintext: &[u8],
    aad: &[u8],
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> Result<SealedRecord, StoreError> {
    seal_with_nonce(plaintext, aad, key, algo, random_nonce())
}

/// Decrypt a SealedRecord. Returns DecryptionAuthFailed if tampered, moved, or keyed differently.
pub fn open(record: &SealedRecord, aad: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, StoreError> {
    let payload = Payload {
        msg: record.ciphertext.as_ref(),
        aad,
    };
    match record.algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            let n = aes_gcm::Nonce::from_slice(&record.nonce.0);
            cipher
                .decrypt(n, payload)
                .map_err(|_| StoreError::DecryptionAuthFailed)
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            let n = chacha20poly1305::Nonce::from_slice(&record.nonce.0);
            cipher
                .decrypt(n, payload)
                .map_err(|_| StoreError::DecryptionAuthFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey([42u8; 32])
    }

    proptest! {
        #[test]
        fn prop_aesgcm_roundtrip(data in prop::collection::vec(0u8..=255, 0..16_384)) {
            let key = test_key();
            let rec = seal(&data, b"id", &key, EncryptionAlgorithm::AesGcm256).unwrap();
            prop_assert_eq!(open(&rec, b"id", &key).unwrap(), data);
        }
        #[test]
        fn prop_chacha_roundtrip(data in prop::collection::vec(0u8..=255, 0..16_384)) {
            let key = test_key();
            let rec = seal(&data, b"id", &key, EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
            prop_assert_eq!(open(&rec, b"id", &key).unwrap(), data);
        }
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = test_key();
        let mut rec = seal(b"secret", b"id", &key, EncryptionAlgorithm::AesGcm256).unwrap();
        rec.ciphertext[0] ^= 0xff;
        assert!(matches!(
            open(&rec, b"id", &key),
            Err(StoreError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let rec = seal(b"secret", b"id", &test_key(), EncryptionAlgorithm::AesGcm256).unwrap();
        let wrong = EncryptionKey([99u8; 32]);
        assert!(matches!(
            open(&rec, b"id", &wrong),
            Err(StoreError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn record_moved_to_other_id_fails() {
        let key = test_key();
        let rec = seal(b"root", b"ROOT-INDEX", &key, EncryptionAlgorithm::AesGcm256).unwrap();
        assert!(matches!(
            open(&rec, b"someone-else", &key),
            Err(StoreError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn envelope_survives_bincode() {
        let key = test_key();
        let rec = seal(b"payload", b"k", &key, EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
        let decoded = SealedRecord::from_bytes(&rec.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, rec);
        assert_eq!(open(&decoded, b"k", &key).unwrap(), b"payload");
    }

    #[test]
    fn garbage_envelope_is_corrupt() {
        assert!(matches!(
            SealedRecord::from_bytes(&[1, 2, 3]),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn algorithm_names_are_stable() {
        assert_eq!(
            serde_json::to_string(&EncryptionAlgorithm::AesGcm256).unwrap(),
            "\"aes-gcm-256\""
        );
        assert_eq!(
            serde_json::to_string(&EncryptionAlgorithm::ChaCha20Poly1305).unwrap(),
            "\"chacha20-poly1305\""
        );
    }
}
