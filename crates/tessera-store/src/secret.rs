//! Short-lived secret sources.
//!
//! The store key is derived from a secret that expires after a TTL (a day by
//! default). When the secret disappears or changes, the store it claimed can
//! no longer be opened and is wiped by [`crate::backend::maybe_expire`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::codec::{b64_decode, b64_encode};
use crate::error::StoreError;
use crate::key::{KeyMarker, Secret, StoreKey};

/// Default secret lifetime: one day.
pub const DEFAULT_SECRET_TTL: Duration = Duration::from_secs(86_400);

/// Clock returning seconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Wall-clock [`Clock`].
pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    })
}

/// Source of the short-lived secret the store key is derived from.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// The current unexpired secret, if any.
    async fn current(&self) -> Result<Option<Secret>, StoreError>;

    /// The current secret, generating and persisting a fresh one if absent or expired.
    async fn get_or_generate(&self) -> Result<Secret, StoreError>;

    /// Deletes the stored secret if its derived key hashes to `marker`.
    async fn clear_if_match(&self, marker: &KeyMarker) -> Result<bool, StoreError>;
}

fn matches_marker(secret: &Secret, marker: &KeyMarker) -> Result<bool, StoreError> {
    Ok(&StoreKey::derive(secret)?.marker == marker)
}

struct Stored {
    secret: Secret,
    expires_at: u64,
}

/// In-process secret holder with an injectable clock.
pub struct MemorySecretSource {
    state: Mutex<Option<Stored>>,
    ttl: Duration,
    clock: Clock,
}

impl MemorySecretSource {
    /// Empty source using the wall clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, system_clock())
    }

    /// Empty source using `clock`.
    pub fn with_clock(ttl: Duration, clock: Clock) -> Self {
        Self {
            state: Mutex::new(None),
            ttl,
            clock,
        }
    }

    /// Installs a known secret, e.g. to simulate another owner.
    pub fn set(&self, secret: Secret) -> Result<(), StoreError> {
        let expires_at = (self.clock)() + self.ttl.as_secs();
        let mut state = self.state.lock().map_err(|e| StoreError::Kv(e.to_string()))?;
        *state = Some(Stored { secret, expires_at });
        Ok(())
    }
}

impl Default for MemorySecretSource {
    fn default() -> Self {
        Self::new(DEFAULT_SECRET_TTL)
    }
}

#[async_trait]
impl SecretSource for MemorySecretSource {
    async fn current(&self) -> Result<Option<Secret>, StoreError> {
        let now = (self.clock)();
        let state = self.state.lock().map_err(|e| StoreError::Kv(e.to_string()))?;
        Ok(state
            .as_ref()
            .filter(|s| now < s.expires_at)
            .map(|s| s.secret.clone()))
    }

    async fn get_or_generate(&self) -> Result<Secret, StoreError> {
        let now = (self.clock)();
        let mut state = self.state.lock().map_err(|e| StoreError::Kv(e.to_string()))?;
        if let Some(s) = state.as_ref().filter(|s| now < s.expires_at) {
            return Ok(s.secret.clone());
        }
        let secret = Secret::generate();
        *state = Some(Stored {
            secret: secret.clone(),
            expires_at: now + self.ttl.as_secs(),
        });
        Ok(secret)
    }

    async fn clear_if_match(&self, marker: &KeyMarker) -> Result<bool, StoreError> {
        let mut state = self.state.lock().map_err(|e| StoreError::Kv(e.to_string()))?;
        let hit = match state.as_ref() {
            Some(s) => matches_marker(&s.secret, marker)?,
            None => false,
        };
        if hit {
            *state = None;
        }
        Ok(hit)
    }
}

#[derive(Serialize, Deserialize)]
struct SecretFile {
    secret: String,
    expires_at: u64,
}

/// Secret persisted as a small JSON file, owner-readable only on Unix.
pub struct FileSecretSource {
    path: PathBuf,
    ttl: Duration,
    clock: Clock,
    lock: tokio::sync::Mutex<()>,
}

impl FileSecretSource {
    /// Source backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self::with_clock(path, ttl, system_clock())
    }

    /// Source backed by `path`, using `clock` for expiry.
    pub fn with_clock(path: impl Into<PathBuf>, ttl: Duration, clock: Clock) -> Self {
        Self {
            path: path.into(),
            ttl,
            clock,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<Option<Stored>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: SecretFile = serde_json::from_slice(&bytes)?;
        Ok(Some(Stored {
            secret: Secret::from_bytes(b64_decode(&file.secret)?),
            expires_at: file.expires_at,
        }))
    }

    async fn write(&self, stored: &Stored) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_vec(&SecretFile {
            secret: b64_encode(stored.secret.as_bytes()),
            expires_at: stored.expires_at,
        })?;
        let mut opts = tokio::fs::OpenOptions::new();
        opts.create(true).write(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut f = opts.open(&self.path).await?;
        f.write_all(&body).await?;
        f.sync_all().await?;
        Ok(())
    }

    async fn remove(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SecretSource for FileSecretSource {
    async fn current(&self) -> Result<Option<Secret>, StoreError> {
        let _g = self.lock.lock().await;
        let now = (self.clock)();
        Ok(self
            .read()
            .await?
            .filter(|s| now < s.expires_at)
            .map(|s| s.secret))
    }

    async fn get_or_generate(&self) -> Result<Secret, StoreError> {
        let _g = self.lock.lock().await;
        let now = (self.clock)();
        if let Some(s) = self.read().await?.filter(|s| now < s.expires_at) {
            return Ok(s.secret);
        }
        let stored = Stored {
            secret: Secret::generate(),
            expires_at: now + self.ttl.as_secs(),
        };
        self.write(&stored).await?;
        info!(path = %self.path.display(), ttl_secs = self.ttl.as_secs(), "generated new store secret");
        Ok(stored.secret)
    }

    async fn clear_if_match(&self, marker: &KeyMarker) -> Result<bool, StoreError> {
        let _g = self.lock.lock().await;
        let Some(stored) = self.read().await? else {
            return Ok(false);
        };
        if !matches_marker(&stored.secret, marker)? {
            return Ok(false);
        }
        self.remove().await?;
        debug!(path = %self.path.display(), "cleared store secret");
        Ok(true)
    }
}
