//!
//! # Exec credential cache
//!
//! Credentials issued by exec helpers are kept on disk, one JSON file per
//! helper invocation, until they expire.
//!
use std::fs;
use std::fs::DirBuilder;
use std::io::Error as IoError;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tokio::task::spawn_blocking;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::Credential;

const CACHE_EXTENSION: &str = "json";
const KEY_LEN: usize = 16;

/// cache key of an exec helper invocation
pub fn key_for(command: &str, args: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    hasher.update(b"|");
    // NUL cannot occur inside an argv element
    for arg in args {
        hasher.update(b"\0");
        hasher.update(arg.as_bytes());
    }
    let mut key = hex::encode(hasher.finalize());
    key.truncate(KEY_LEN);
    key
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    credential: Credential,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

#[derive(Debug, Clone)]
pub struct CredentialCache {
    dir: PathBuf,
}

impl CredentialCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// per-user cache location
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".kube").join("cache")))
            .map(|base| base.join("k8-client").join("exec"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{CACHE_EXTENSION}"))
    }

    /// cached credential, expired entries are deleted and never returned
    pub async fn get(&self, key: &str) -> Option<Credential> {
        let cache = self.clone();
        let key = key.to_owned();
        match spawn_blocking(move || cache.load(&key)).await {
            Ok(credential) => credential,
            Err(err) => {
                warn!(%err, "credential cache lookup did not complete");
                None
            }
        }
    }

    /// store credential; failures are logged since the cache is only an optimization
    pub async fn set(&self, key: &str, credential: &Credential, expires_at: Option<DateTime<Utc>>) {
        let cache = self.clone();
        let key = key.to_owned();
        let credential = credential.clone();
        let stored = spawn_blocking(move || cache.store(&key, &credential, expires_at))
            .await
            .map_err(IoError::other)
            .and_then(|stored| stored);
        if let Err(err) = stored {
            warn!(%err, "unable to cache credential");
        }
    }

    /// delete every cached entry
    pub async fn clear_all(&self) -> Result<(), IoError> {
        let cache = self.clone();
        spawn_blocking(move || cache.remove_all())
            .await
            .map_err(IoError::other)?
    }

    fn load(&self, key: &str) -> Option<Credential> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                trace!(key, "cache miss");
                return None;
            }
            Err(err) => {
                warn!(?path, %err, "unable to read cached credential");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(?path, %err, "discarding unreadable cache entry");
                self.remove(&path);
                return None;
            }
        };

        if entry.is_expired(Utc::now()) {
            debug!(key, expires_at = ?entry.expires_at, "cached credential expired");
            self.remove(&path);
            return None;
        }

        debug!(key, "cache hit");
        Some(entry.credential)
    }

    fn store(
        &self,
        key: &str,
        credential: &Credential,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), IoError> {
        self.ensure_dir()?;

        let entry = CacheEntry {
            credential: credential.clone(),
            expires_at,
        };
        let bytes = serde_json::to_vec(&entry)?;

        // tempfile creates owner-only files, rename keeps readers from seeing partial writes
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        let path = self.entry_path(key);
        file.persist(&path).map_err(|err| err.error)?;
        set_owner_only(&path, 0o600)?;
        debug!(key, ?expires_at, "cached credential");
        Ok(())
    }

    fn remove_all(&self) -> Result<(), IoError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == CACHE_EXTENSION) {
                fs::remove_file(&path)?;
            }
        }
        debug!(dir = ?self.dir, "cleared credential cache");
        Ok(())
    }

    fn ensure_dir(&self) -> Result<(), IoError> {
        if self.dir.is_dir() {
            return Ok(());
        }

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.dir)?;
        set_owner_only(&self.dir, 0o700)
    }

    fn remove(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(?path, %err, "unable to remove cache entry");
            }
        }
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path, mode: u32) -> Result<(), IoError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path, _mode: u32) -> Result<(), IoError> {
    Ok(())
}
