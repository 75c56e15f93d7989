//! Namespaced key/value persistence for session and institute hints.
//!
//! DESIGN
//! ======
//! Every key this crate writes is enumerated in [`CacheKey`] and stored under
//! `{namespace}_{suffix}`, so a logout can remove the whole set without
//! scanning storage. Values are plain strings; JSON helpers sit on top.
//!
//! ERROR HANDLING
//! ==============
//! Reads never fail: storage errors and unparsable JSON both read as absent.
//! Writes report errors so callers can log them, but resolution never blocks
//! on a failed write.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

pub const DEFAULT_NAMESPACE: &str = "nexora";

// =============================================================================
// KEYS
// =============================================================================

/// Every entry the portal ever persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    InstituteId,
    InstituteProfile,
    RoleHint,
    FullName,
    Email,
    InstitutionName,
    AuthToken,
}

impl CacheKey {
    pub const ALL: [CacheKey; 7] = [
        CacheKey::InstituteId,
        CacheKey::InstituteProfile,
        CacheKey::RoleHint,
        CacheKey::FullName,
        CacheKey::Email,
        CacheKey::InstitutionName,
        CacheKey::AuthToken,
    ];

    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            CacheKey::InstituteId => "institute_id",
            CacheKey::InstituteProfile => "institute_profile",
            CacheKey::RoleHint => "role_context",
            CacheKey::FullName => "full_name",
            CacheKey::Email => "email",
            CacheKey::InstitutionName => "institution_name",
            CacheKey::AuthToken => "auth_token",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache value encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

// =============================================================================
// STORAGE BACKENDS
// =============================================================================

/// Raw string storage underneath [`PersistentCache`].
pub trait StorageBackend: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), CacheError>;
    fn remove_item(&self, key: &str) -> Result<(), CacheError>;

    /// Remove several keys. Backends that can do this in one write override it.
    fn remove_many(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut first_err = None;
        for key in keys {
            if let Err(e) = self.remove_item(key) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Process-local storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items across all namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, CacheError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), CacheError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.remove(key);
        Ok(())
    }

    fn remove_many(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            items.remove(key);
        }
        Ok(())
    }
}

/// A single JSON document on disk, re-read on every operation so writes from
/// another process are picked up on the next read (last writer wins).
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, CacheError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(items) => Ok(items),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cache file unreadable; starting empty");
                Ok(BTreeMap::new())
            }
        }
    }

    fn store(&self, items: &BTreeMap<String, String>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(items)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<(), CacheError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items = self.load()?;
        apply(&mut items);
        self.store(&items)
    }
}

impl StorageBackend for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, CacheError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.update(|items| {
            items.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove_item(&self, key: &str) -> Result<(), CacheError> {
        self.update(|items| {
            items.remove(key);
        })
    }

    fn remove_many(&self, keys: &[String]) -> Result<(), CacheError> {
        self.update(|items| {
            for key in keys {
                items.remove(key);
            }
        })
    }
}

// =============================================================================
// PERSISTENT CACHE
// =============================================================================

/// Namespaced view over a [`StorageBackend`]. Cheap to clone.
#[derive(Clone)]
pub struct PersistentCache {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
}

impl std::fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCache").field("namespace", &self.namespace).finish_non_exhaustive()
    }
}

impl PersistentCache {
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: impl Into<String>) -> Self {
        Self { backend, namespace: namespace.into() }
    }

    /// A cache over a fresh [`MemoryStore`] in the default namespace.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), DEFAULT_NAMESPACE)
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn storage_key(&self, key: CacheKey) -> String {
        format!("{}_{}", self.namespace, key.suffix())
    }

    #[must_use]
    pub fn get(&self, key: CacheKey) -> Option<String> {
        match self.backend.get_item(&self.storage_key(key)) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = key.suffix(), error = %e, "cache read failed; treating as absent");
                None
            }
        }
    }

    /// Read and parse a JSON entry. Corrupt entries read as absent.
    #[must_use]
    pub fn get_json<T: DeserializeOwned>(&self, key: CacheKey) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = key.suffix(), error = %e, "discarding corrupt cache entry");
                None
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage write fails.
    pub fn set(&self, key: CacheKey, value: &str) -> Result<(), CacheError> {
        self.backend.set_item(&self.storage_key(key), value)
    }

    /// # Errors
    ///
    /// Returns [`CacheError`] if encoding or the storage write fails.
    pub fn set_json<T: Serialize>(&self, key: CacheKey, value: &T) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }

    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage write fails.
    pub fn remove(&self, key: CacheKey) -> Result<(), CacheError> {
        self.backend.remove_item(&self.storage_key(key))
    }

    /// Remove every key in [`CacheKey::ALL`] for this namespace.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage write fails.
    pub fn clear_namespace(&self) -> Result<(), CacheError> {
        let keys: Vec<String> = CacheKey::ALL.iter().map(|k| self.storage_key(*k)).collect();
        self.backend.remove_many(&keys)
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod tests;
