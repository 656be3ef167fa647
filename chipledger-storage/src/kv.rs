//! Key/value persistence backends.
//!
//! The local store only needs a flat string-to-string map with bounded
//! capacity and no cross-key transactions, the same contract a browser's
//! `localStorage` or a mobile preferences file offers. Two backends ship
//! here: an in-memory map (with fault injection for tests) and a directory
//! of files.

use crate::error::{StorageError, StorageResult};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// A flat key/value store with no transactional guarantees across keys.
pub trait KeyValueStore: Send + Sync {
    /// Reads a value. Missing keys are `Ok(None)`.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Writes a value, replacing any existing one.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Removes a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Removes every key.
    fn clear(&self) -> StorageResult<()>;

    /// Maximum bytes the backend accepts, if bounded.
    fn capacity(&self) -> Option<usize>;
}

/// In-memory backend.
///
/// Capacity is measured as the total bytes of all keys and values. Tests
/// can make writes fail or plant raw (possibly corrupt) values.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
    capacity: Option<usize>,
    fail_writes: AtomicBool,
}

impl MemoryKeyValueStore {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that rejects writes beyond `capacity` total bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Makes every subsequent `set` fail until turned off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes a raw value, bypassing capacity and failure injection.
    pub fn plant(&self, key: &str, raw: &str) {
        self.lock().insert(key.to_string(), raw.to_string());
    }

    /// Returns all keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total bytes currently stored.
    pub fn used_bytes(&self) -> usize {
        Self::size_of(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn size_of(entries: &HashMap<String, String>) -> usize {
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed(format!("injected failure for {key}")));
        }
        let mut entries = self.lock();
        if let Some(capacity) = self.capacity {
            let existing = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let needed = Self::size_of(&entries) - existing + key.len() + value.len();
            if needed > capacity {
                return Err(StorageError::QuotaExceeded { needed, capacity });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        self.lock().clear();
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

const FILE_EXTENSION: &str = "json";

/// Directory-backed store: one file per key.
///
/// Keys are escaped into file names so that namespaces with `:` or `/`
/// stay inside the directory.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
    max_value_bytes: Option<usize>,
}

impl FileKeyValueStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            info!("Created local store directory: {:?}", dir);
        }
        Ok(Self {
            dir,
            max_value_bytes: None,
        })
    }

    /// Rejects single values larger than `max` bytes.
    #[must_use]
    pub fn with_max_value_bytes(mut self, max: usize) -> Self {
        self.max_value_bytes = Some(max);
        self
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{FILE_EXTENSION}", escape_key(key)))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        if let Some(capacity) = self.max_value_bytes {
            if value.len() > capacity {
                return Err(StorageError::QuotaExceeded {
                    needed: value.len(),
                    capacity,
                });
            }
        }
        let path = self.path_for(key);
        fs::write(&path, value)?;
        debug!("Wrote {} bytes to {:?}", value.len(), path);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> StorageResult<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == FILE_EXTENSION) {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        self.max_value_bytes
    }
}

/// Escapes everything outside `[A-Za-z0-9._-]` as `%XX`.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
