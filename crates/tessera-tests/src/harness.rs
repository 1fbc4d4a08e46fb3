//! Test Harness - export fixtures and ready-made vaults

use std::io::{self, Write};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use tessera_ingest::{IngestOptions, InputFile, ProviderRegistry, ProviderSpec, Vault};
use tessera_store::{ConnectionManager, EncryptionAlgorithm, KvStore, MemoryKvStore, MemorySecretSource, Store};
use zip::write::SimpleFileOptions;

/// Provider used across the scenarios: JSON posts with RFC 3339 times,
/// CSV check-ins with SQL times and a JSON account blob.
pub const ACME_PROVIDER: &str = r#"
slug = "acme"
display_name = "Acme"
categories = ["post", "checkin"]
ignore = ["media/**/*", "*.png"]

[profile]
glob = "profiles.json"
field = "name"

[[metadata]]
glob = "account.json"
key = "account"
tokenizer = "json_value"

[[timeline]]
glob = "a.json"
category = "post"
time_field = "ts"
title = "{text}"
profile_field = "by"

[[timeline]]
glob = "b.csv"
category = "checkin"
time_field = "date"
time_format = "sql"
title = "Checked in at {place}"
"#;

/// Second provider, so resets have something left over.
pub const ZETA_PROVIDER: &str = r#"
slug = "zeta"
categories = ["event"]

[[timeline]]
glob = "events.jsonl"
category = "event"
time_field = "at"
time_format = "unix"
title = "{name}"
"#;

pub fn acme_spec() -> ProviderSpec {
    parse_spec(ACME_PROVIDER)
}

pub fn zeta_spec() -> ProviderSpec {
    parse_spec(ZETA_PROVIDER)
}

fn parse_spec(text: &str) -> ProviderSpec {
    match toml::from_str(text) {
        Ok(spec) => spec,
        Err(e) => panic!("fixture provider spec is invalid: {}", e),
    }
}

/// Files to pack into an archive fixture.
#[derive(Debug, Clone, Default)]
pub struct ExportBuilder {
    entries: Vec<(String, Vec<u8>)>,
}

impl ExportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, name: &str, data: impl AsRef<[u8]>) -> Self {
        self.entries.push((name.to_string(), data.as_ref().to_vec()));
        self
    }

    pub fn zip(&self) -> io::Result<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, data) in &self.entries {
            writer.start_file(name.as_str(), SimpleFileOptions::default())?;
            writer.write_all(data)?;
        }
        Ok(writer.finish()?.into_inner())
    }

    pub fn tar_gz(&self) -> io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, data) in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_slice())?;
        }
        builder.into_inner()?.finish()
    }
}

pub fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// The two-file acme export: two posts and three check-ins, one of which
/// has an unreadable date.
pub fn acme_export() -> io::Result<InputFile> {
    let posts = r#"[
        {"ts": "2023-03-01T09:00:00Z", "text": "first", "by": "ann"},
        {"ts": "2023-03-02T09:00:00Z", "text": "second", "by": "bob"}
    ]"#;
    let checkins = "date,place\n2023-03-01 12:00:00,cafe\nyesterday,park\n2023-03-03 18:30:00,gym\n";
    let data = ExportBuilder::new()
        .file("a.json", posts)
        .file("b.csv", checkins)
        .zip()?;
    Ok(InputFile::new("acme.zip", data))
}

/// A vault over an in-memory table with the fixture providers registered.
pub struct TestVault {
    pub kv: Arc<dyn KvStore>,
    pub secrets: Arc<MemorySecretSource>,
    pub vault: Vault,
}

impl TestVault {
    pub fn new() -> Self {
        Self::with_kv(Arc::new(MemoryKvStore::new()))
    }

    pub fn with_kv(kv: Arc<dyn KvStore>) -> Self {
        Self::build(kv, IngestOptions::default())
    }

    pub fn with_options(options: IngestOptions) -> Self {
        Self::build(Arc::new(MemoryKvStore::new()), options)
    }

    fn build(kv: Arc<dyn KvStore>, options: IngestOptions) -> Self {
        let secrets = Arc::new(MemorySecretSource::default());
        let store = Store::new(kv.clone(), EncryptionAlgorithm::default());
        let manager = ConnectionManager::new(store, secrets.clone());
        let registry = match ProviderRegistry::from_specs(&[acme_spec(), zeta_spec()]) {
            Ok(r) => r,
            Err(e) => panic!("fixture registry failed to compile: {}", e),
        };
        Self {
            kv,
            secrets,
            vault: Vault::new(manager, registry, options),
        }
    }

    /// A second vault onto the same store and secret, with its own caches.
    pub fn sibling(&self) -> Vault {
        let store = self.vault.manager().store().clone();
        let manager = ConnectionManager::new(store, self.secrets.clone());
        Vault::new(manager, self.vault.registry().clone(), self.vault.options())
    }
}

impl Default for TestVault {
    fn default() -> Self {
        Self::new()
    }
}
