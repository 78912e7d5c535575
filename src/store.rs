//! Generic key-value storage
//!
//! Applications built on the stream keep small pieces of state (watched
//! symbols, last selected quote, ...) behind this trait. The streaming core
//! does not use it. [`MemoryStore`] lives only as long as the process;
//! [`FileStore`] survives restarts.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One entry for `set_multiple`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair<T> {
    pub key: String,
    pub value: T,
}

impl<T> KeyValuePair<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Key-value store abstraction
#[async_trait]
pub trait KeyValueStore<T: Clone + Send + Sync + 'static>: Send + Sync {
    /// Gets the value stored under `key`
    async fn get(&self, key: &str) -> Option<T>;

    /// Gets several keys at once; missing keys map to `None`
    async fn get_multiple(&self, keys: &[&str]) -> HashMap<String, Option<T>> {
        let mut values = HashMap::with_capacity(keys.len());
        for key in keys {
            values.insert(key.to_string(), self.get(key).await);
        }
        values
    }

    /// Stores `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: T);

    /// Stores several entries
    async fn set_multiple(&self, entries: Vec<KeyValuePair<T>>) {
        for entry in entries {
            self.set(&entry.key, entry.value).await;
        }
    }

    /// Removes `key`
    async fn delete(&self, key: &str);

    /// Removes several keys
    async fn delete_multiple(&self, keys: &[&str]) {
        for key in keys {
            self.delete(key).await;
        }
    }
}

/// In-memory store, not persisted
pub struct MemoryStore<T> {
    entries: Arc<RwLock<HashMap<String, T>>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a store seeded with `entries`
    pub fn with_entries(entries: Vec<KeyValuePair<T>>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(
                entries.into_iter().map(|e| (e.key, e.value)).collect(),
            )),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> KeyValueStore<T> for MemoryStore<T> {
    async fn get(&self, key: &str) -> Option<T> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: T) {
        self.entries.write().await.insert(key.to_string(), value);
        tracing::trace!(key, "Stored value");
    }

    async fn set_multiple(&self, entries: Vec<KeyValuePair<T>>) {
        let mut map = self.entries.write().await;
        for entry in entries {
            map.insert(entry.key, entry.value);
        }
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

/// Store persisted as a single JSON object on disk
///
/// Every write rewrites the whole file through a temporary file and a rename.
/// Write failures are logged; the in-memory view stays authoritative.
pub struct FileStore<T> {
    path: PathBuf,
    entries: RwLock<HashMap<String, T>>,
}

impl<T> FileStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Loads the store at `path`; a missing file starts empty
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => HashMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), entries = entries.len(), "Opened file store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &HashMap<String, T>) {
        if let Err(e) = self.write_file(entries).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to persist store");
        }
    }

    async fn write_file(&self, entries: &HashMap<String, T>) -> Result<(), StoreError> {
        let text = serde_json::to_string(entries)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl<T> KeyValueStore<T> for FileStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<T> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: T) {
        let mut map = self.entries.write().await;
        map.insert(key.to_string(), value);
        self.persist(&map).await;
    }

    async fn set_multiple(&self, entries: Vec<KeyValuePair<T>>) {
        let mut map = self.entries.write().await;
        for entry in entries {
            map.insert(entry.key, entry.value);
        }
        self.persist(&map).await;
    }

    async fn delete(&self, key: &str) {
        let mut map = self.entries.write().await;
        if map.remove(key).is_some() {
            self.persist(&map).await;
        }
    }

    async fn delete_multiple(&self, keys: &[&str]) {
        let mut map = self.entries.write().await;
        let before = map.len();
        for key in keys {
            map.remove(*key);
        }
        if map.len() != before {
            self.persist(&map).await;
        }
    }
}
