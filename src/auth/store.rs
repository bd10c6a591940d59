//! Token persistence.
//!
//! The token file is the only persistent mutable resource the gateway owns.
//! Writes go to a sibling temp file which is fsynced and renamed over the
//! target, so a reader sees either the previous token or the new one.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Credential;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no stored token")]
    NotFound,

    #[error("token persistence failed: {0}")]
    Io(String),
}

/// Abstraction over credential persistence backends.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load the persisted credential. Absent or unreadable tokens are `NotFound`.
    async fn load(&self) -> Result<Credential, StoreError>;

    /// Persist the credential, replacing any previous one atomically.
    async fn save(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Remove the persisted credential. A missing token is not an error.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// On-disk form of a [`Credential`].
#[derive(Debug, Serialize, Deserialize)]
struct PersistedToken {
    version: u32,
    /// OAuth client the refresh token was issued to.
    identity: String,
    #[serde(flatten)]
    credential: Credential,
}

/// JSON token file with `0600` permissions.
pub struct FileTokenStore {
    path: PathBuf,
    identity: String,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            identity: identity.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Credential, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound);
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "token file unreadable, treating as absent");
                return Err(StoreError::NotFound);
            }
        };

        let persisted: PersistedToken = match serde_json::from_slice(&raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "token file corrupt, treating as absent");
                return Err(StoreError::NotFound);
            }
        };

        if persisted.version != FORMAT_VERSION {
            tracing::warn!(version = persisted.version, "unsupported token file version, treating as absent");
            return Err(StoreError::NotFound);
        }
        if persisted.identity != self.identity {
            tracing::warn!("stored token was issued to a different OAuth client, treating as absent");
            return Err(StoreError::NotFound);
        }

        Ok(persisted.credential)
    }

    async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(&PersistedToken {
            version: FORMAT_VERSION,
            identity: self.identity.clone(),
            credential: credential.clone(),
        })
        .map_err(|e| StoreError::Io(e.to_string()))?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &body))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
            .map_err(|e| StoreError::Io(e.to_string()))?;

        tracing::debug!(path = %self.path.display(), "token persisted");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }
}

/// Write-to-temp, fsync, rename. The temp file lives in the target directory
/// so the rename never crosses filesystems.
fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "token".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let result = write_and_rename(&tmp, path, body);
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
        return result;
    }

    // Make the rename itself durable.
    if let Ok(d) = std::fs::File::open(&dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

fn write_and_rename(tmp: &Path, path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = open_private(tmp)?;
    file.write_all(body)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(tmp, path)?;
    restrict_permissions(path)
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// In-memory store for broker tests.
#[cfg(test)]
pub(crate) struct MemoryTokenStore {
    pub(crate) token: std::sync::Mutex<Option<Credential>>,
    pub(crate) saves: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryTokenStore {
    pub(crate) fn new(token: Option<Credential>) -> Self {
        Self {
            token: std::sync::Mutex::new(token),
            saves: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub(crate) fn current(&self) -> Option<Credential> {
        self.token.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Credential, StoreError> {
        self.current().ok_or(StoreError::NotFound)
    }

    async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        *self.token.lock().unwrap() = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.token.lock().unwrap() = None;
        Ok(())
    }
}
