//! Vault settings loaded from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tessera_store::{EncryptionAlgorithm, WriterConfig};

use crate::configured::ProviderSpec;
use crate::ingest::IngestOptions;
use crate::stream::DEFAULT_CHUNK_SIZE;

const MIB: u64 = 1024 * 1024;

/// Everything needed to open a vault. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory of the durable record table
    pub data_dir: PathBuf,
    /// File holding the store secret
    pub secret_path: PathBuf,
    /// Seconds before the secret expires and the store is wiped
    pub secret_ttl_secs: u64,
    /// Leaf files above this size are recorded as skipped
    pub file_size_limit_mb: u64,
    /// Timeline entries sealed together into one record
    pub timeline_batch_size: usize,
    /// Buffered file payloads that trigger a flush
    pub file_buffer_limit_mb: u64,
    /// Sealed timeline batches buffered before a flush
    pub timeline_flush_records: usize,
    /// Read size used while expanding containers
    pub stream_chunk_size: usize,
    /// Interval of the background expiry check
    pub expiry_check_secs: u64,
    /// Cipher for newly sealed records
    pub cipher: EncryptionAlgorithm,
    /// Declarative providers
    pub providers: Vec<ProviderSpec>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tessera-data"),
            secret_path: PathBuf::from("tessera-data/secret.json"),
            secret_ttl_secs: 86_400,
            file_size_limit_mb: 128,
            timeline_batch_size: 64,
            file_buffer_limit_mb: 16,
            timeline_flush_records: 16,
            stream_chunk_size: DEFAULT_CHUNK_SIZE,
            expiry_check_secs: 60,
            cipher: EncryptionAlgorithm::default(),
            providers: Vec::new(),
        }
    }
}

impl VaultConfig {
    /// Parses a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: VaultConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: VaultConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Loads `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Secret lifetime.
    pub fn secret_ttl(&self) -> Duration {
        Duration::from_secs(self.secret_ttl_secs)
    }

    /// Expiry check interval, never below one second.
    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_secs.max(1))
    }

    /// Store writer buffering.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            timeline_batch_size: self.timeline_batch_size,
            file_buffer_limit_bytes: (self.file_buffer_limit_mb * MIB) as usize,
            timeline_flush_records: self.timeline_flush_records,
        }
    }

    /// Size limits for an ingest run.
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            size_limit: self.file_size_limit_mb * MIB,
            chunk_size: self.stream_chunk_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = VaultConfig::default();
        assert_eq!(config.secret_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.ingest_options().size_limit, 128 * MIB);
        assert_eq!(config.ingest_options().chunk_size, 64 * 1024);
        assert_eq!(config.writer_config(), WriterConfig::default());
        assert_eq!(config.cipher, EncryptionAlgorithm::AesGcm256);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "data_dir": "/vault/data",
                "file_size_limit_mb": 8,
                "cipher": "chacha20-poly1305"
            }}"#
        )
        .unwrap();

        let config = VaultConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/vault/data"));
        assert_eq!(config.ingest_options().size_limit, 8 * MIB);
        assert_eq!(config.cipher, EncryptionAlgorithm::ChaCha20Poly1305);
        assert_eq!(config.timeline_batch_size, 64);
    }

    #[test]
    fn test_from_file_toml_with_provider() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
data_dir = "/toml/data"
secret_path = "/toml/secret.json"
timeline_batch_size = 8

[[providers]]
slug = "acme"
categories = ["post"]

[[providers.timeline]]
glob = "posts.json"
category = "post"
time_field = "created"
title = "{{text}}"
"#
        )
        .unwrap();

        let config = VaultConfig::from_file(file.path()).unwrap();
        assert_eq!(config.secret_path, PathBuf::from("/toml/secret.json"));
        assert_eq!(config.writer_config().timeline_batch_size, 8);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].timeline[0].title, "{text}");
        assert!(config.providers[0].compile().is_ok());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = VaultConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported config file extension"));
    }

    #[test]
    fn test_load_or_default_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, VaultConfig::default());
    }
}
