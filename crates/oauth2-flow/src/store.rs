//! Credential persistence
//!
//! `CredentialStore` shapes keys and (de)serializes credentials on top of a
//! `KeyValueStore` backend. Each flow gets a store scoped to its provider
//! name, so one user can hold independent credentials per provider.
//!
//! Backends:
//! - `MemoryStore`: process-local, lost on restart
//! - `FileStore`: JSON file, every mutation persisted with an atomic
//!   temp-file + rename so a crash never leaves a torn file

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::error::{Error, Result};
use crate::token::Credential;

/// Byte-oriented key-value persistence.
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` when the key has never been set or was deleted.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.entries.read().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.write().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.write().await.remove(key);
            Ok(())
        })
    }
}

/// JSON file backend. Values are stored base64-encoded.
///
/// The Mutex serializes every write, so concurrent `set`s from parallel
/// callbacks cannot interleave their file writes.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Load the store from `path`, creating it as `{}` if it doesn't exist.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading store file: {e}")))?;
            let entries: BTreeMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing store file: {e}")))?;
            info!(path = %path.display(), entries = entries.len(), "loaded credential store");
            entries
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let entries = BTreeMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            state
                .get(key)
                .map(|encoded| {
                    STANDARD
                        .decode(encoded)
                        .map_err(|e| Error::Store(format!("decoding value for {key}: {e}")))
                })
                .transpose()
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(key.to_string(), STANDARD.encode(value));
            write_atomic(&self.path, &state).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(key).is_some() {
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

/// Write the store to `path` atomically.
///
/// Writes a temp file in the same directory and renames it over the
/// target. The file holds access tokens, so it is created 0600 on unix.
async fn write_atomic(path: &Path, data: &BTreeMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Store(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Store("store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".oauth2-store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted credential store");
    Ok(())
}

/// Per-provider credential cache.
#[derive(Clone)]
pub struct CredentialStore {
    namespace: String,
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(namespace: impl Into<String>, backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            namespace: namespace.into(),
            backend,
        }
    }

    fn key(&self, user_id: &str) -> String {
        format!("auth:{}:{}", self.namespace, user_id)
    }

    /// Stored credential for `user_id`, if any.
    ///
    /// Backend failures and undecodable payloads are logged and reported as
    /// a miss; the user is simply asked to log in again.
    pub async fn get(&self, user_id: &str) -> Option<Credential> {
        let bytes = match self.backend.get(&self.key(user_id)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(provider = %self.namespace, user_id, error = %e, "credential lookup failed");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(credential) => Some(credential),
            Err(e) => {
                warn!(provider = %self.namespace, user_id, error = %e, "discarding undecodable credential");
                None
            }
        }
    }

    /// Insert or replace the credential for `user_id`.
    pub async fn set(&self, user_id: &str, credential: &Credential) -> Result<()> {
        let bytes = serde_json::to_vec(credential)
            .map_err(|e| Error::Store(format!("serializing credential: {e}")))?;
        self.backend.set(&self.key(user_id), bytes).await?;
        debug!(provider = %self.namespace, user_id, "stored credential");
        Ok(())
    }

    pub async fn delete(&self, user_id: &str) -> Result<()> {
        self.backend.delete(&self.key(user_id)).await?;
        debug!(provider = %self.namespace, user_id, "deleted credential");
        Ok(())
    }
}
