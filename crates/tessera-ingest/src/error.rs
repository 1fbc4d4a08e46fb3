//! Error types for the tessera-ingest subsystem

use tessera_store::StoreError;

/// Text could not be decoded to a printable Unicode string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// No candidate decoding passed the printable check
    #[error("could not decode data to a printable Unicode string")]
    NotPrintable,
}

/// All errors surfaced by ingestion, the worker and the vault facade
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Storage fault from the encrypted store
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// No provider is registered under this slug
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    /// A top-level input is not a recognized container
    #[error("unsupported input file: {name}")]
    UnsupportedInput {
        /// File name of the input
        name: String,
    },
    /// A container could not be read
    #[error("corrupt archive {path}: {reason}")]
    CorruptArchive {
        /// Joined path of the container
        path: String,
        /// Underlying failure
        reason: String,
    },
    /// A rule's glob pattern does not compile
    #[error("invalid glob {pattern:?}: {reason}")]
    InvalidGlob {
        /// The pattern as written
        pattern: String,
        /// Compiler message
        reason: String,
    },
    /// A declarative provider spec is inconsistent
    #[error("invalid provider spec {slug}: {reason}")]
    InvalidProviderSpec {
        /// Provider slug
        slug: String,
        /// What is wrong
        reason: String,
    },
    /// Text decoding failed
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The background worker is gone
    #[error("import worker has shut down")]
    WorkerClosed,
    /// I/O error reading inputs
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate
pub type IngestResult<T> = Result<T, IngestError>;
