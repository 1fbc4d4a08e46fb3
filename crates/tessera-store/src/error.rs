//! Error types for the tessera-store subsystem

/// All errors that can occur while reading or writing the encrypted store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The durable key/value mechanism rejected or failed an operation
    #[error("Key/value store failure: {0}")]
    Kv(String),
    /// I/O error from a file-backed store or secret file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A record could not be serialized or deserialized
    #[error("Serialization failed: {0}")]
    Serialization(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Decryption authentication tag mismatch: data corrupted or tampered
    #[error("Decryption failed: authentication tag mismatch (data may be corrupted)")]
    DecryptionAuthFailed,
    /// The store was claimed under a different secret
    #[error("Store was created under a different secret")]
    KeyMismatch,
    /// A write was attempted without a connected backend
    #[error("No backend connection is available")]
    NotConnected,
    /// An index entry points at a payload record that does not exist
    #[error("Payload record {0} is missing")]
    MissingPayload(String),
    /// A stored structure is internally inconsistent
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Convenience alias used throughout the crate
pub type StoreResult<T> = Result<T, StoreError>;
