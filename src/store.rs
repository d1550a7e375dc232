//! Durable key/value storage for dashboard state
//!
//! Histories, prediction ledgers, the device list and visibility flags are
//! persisted as JSON documents behind the [`Store`] trait so the dashboard
//! logic never touches a concrete backend. Every document is wrapped in a
//! versioned envelope; a document written by an incompatible format version
//! is reported as [`StoreError::VersionMismatch`] instead of being silently
//! misread.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Format version written into every persisted document
pub const STORE_VERSION: u32 = 1;

pub const KEY_DEVICES: &str = "availableDevices";
pub const KEY_SELECTED_DEVICE: &str = "selectedDevice";
pub const KEY_VISIBILITY: &str = "visibility";

pub fn history_key(device_id: &str) -> String {
    format!("history:{}", device_id)
}

pub fn predictions_key(device_id: &str, metric: &str) -> String {
    format!("predictions:{}:{}", device_id, metric)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stored format version {found} does not match expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Storage backend poisoned")]
    Poisoned,
}

/// Raw string key/value backend
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    data: T,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

/// Load and decode a versioned JSON document
pub fn load<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>, StoreError> {
    let raw = match store.get(key)? {
        Some(raw) => raw,
        None => return Ok(None),
    };

    let header: VersionHeader = serde_json::from_str(&raw)?;
    if header.version != STORE_VERSION {
        return Err(StoreError::VersionMismatch {
            found: header.version,
            expected: STORE_VERSION,
        });
    }

    let envelope: Envelope<T> = serde_json::from_str(&raw)?;
    debug!(key = %key, version = envelope.version, "Loaded persisted document");
    Ok(Some(envelope.data))
}

/// Encode and store a versioned JSON document
pub fn save<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<(), StoreError> {
    let raw = serde_json::to_string(&EnvelopeRef {
        version: STORE_VERSION,
        data: value,
    })?;
    store.set(key, raw)
}

/// Process-local store, used in tests and when no data directory is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a data directory.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }
}

/// Map an arbitrary key to a collision-free file name
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{:02x}", byte));
        }
    }
    encoded
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        save(&store, KEY_DEVICES, &vec!["a".to_string(), "b".to_string()]).unwrap();

        let devices: Vec<String> = load(&store, KEY_DEVICES).unwrap().unwrap();
        assert_eq!(devices, vec!["a", "b"]);

        store.delete(KEY_DEVICES).unwrap();
        assert!(load::<Vec<String>>(&store, KEY_DEVICES).unwrap().is_none());
    }

    #[test]
    fn test_version_mismatch_is_reported() {
        let store = MemoryStore::new();
        store
            .set(KEY_DEVICES, r#"{"version":99,"data":["a"]}"#.to_string())
            .unwrap();

        let result = load::<Vec<String>>(&store, KEY_DEVICES);
        assert!(matches!(
            result,
            Err(StoreError::VersionMismatch { found: 99, expected: STORE_VERSION })
        ));
    }

    #[test]
    fn test_unversioned_document_is_rejected() {
        let store = MemoryStore::new();
        store.set(KEY_DEVICES, r#"["a","b"]"#.to_string()).unwrap();

        assert!(matches!(
            load::<Vec<String>>(&store, KEY_DEVICES),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_key_encoding_is_filesystem_safe() {
        assert_eq!(encode_key("history:b8:27"), "history_3ab8_3a27");
        assert_ne!(encode_key("a_3a"), encode_key("a:"));
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let key = history_key("b8:27:eb:bf:9d:51");

        assert!(store.get(&key).unwrap().is_none());

        save(&store, &key, &vec![1, 2, 3]).unwrap();
        let values: Vec<i32> = load(&store, &key).unwrap().unwrap();
        assert_eq!(values, vec![1, 2, 3]);

        store.delete(&key).unwrap();
        store.delete(&key).unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }
}
