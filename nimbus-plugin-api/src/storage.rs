//! Key-value storage handed to plugins
//!
//! Provides trait-based storage that embedders can back with anything; the
//! in-memory implementation is used by default and in tests.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend failure: {0}")]
    Backend(String),

    #[error("Storage is read-only")]
    ReadOnly,
}

/// A single storage namespace
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Returns whether the key existed
    fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Keys starting with `prefix`, in lexicographic order
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Creates storage namespaces
pub trait StorageFactory: Send + Sync {
    fn storage(&self, namespace: &str) -> Arc<dyn Storage>;
}

/// In-memory storage namespace
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// In-memory factory; the same namespace always yields the same storage
#[derive(Default)]
pub struct MemoryStorageFactory {
    namespaces: RwLock<HashMap<String, Arc<MemoryStorage>>>,
}

impl MemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageFactory for MemoryStorageFactory {
    fn storage(&self, namespace: &str) -> Arc<dyn Storage> {
        if let Some(storage) = self.namespaces.read().get(namespace) {
            return storage.clone();
        }
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }
}

/// Storage factory scoped to one plugin: namespaces are prefixed with the
/// plugin's name so plugins never see each other's data.
#[derive(Clone)]
pub struct PluginStorageFactory {
    inner: Arc<dyn StorageFactory>,
    plugin: String,
}

impl PluginStorageFactory {
    pub fn new(inner: Arc<dyn StorageFactory>, plugin: impl Into<String>) -> Self {
        Self {
            inner,
            plugin: plugin.into(),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn storage(&self, namespace: &str) -> Arc<dyn Storage> {
        self.inner
            .storage(&format!("{}:{}", self.plugin, namespace))
    }
}
