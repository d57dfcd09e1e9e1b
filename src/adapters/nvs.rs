//! NVS-style settings store.
//!
//! Implements [`SettingsStore`] over a namespaced key/blob map.  Values are
//! postcard-encoded; keys are `namespace::key` composites so subsystems
//! never collide.
//!
//! # Durability
//!
//! - **In-memory** ([`NvsStore::in_memory`]): dev/test only.
//! - **File-backed** ([`NvsStore::open`]): every write re-serialises the
//!   whole map to `<path>.tmp` and renames it over `<path>`, so a crash
//!   leaves either the old or the new snapshot, never a torn one.  A write
//!   that fails to persist is rolled back in memory as well.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::commands::{Connection, NodeRecord};
use crate::app::events::Update;
use crate::app::ports::SettingsStore;
use crate::error::StorageError;

const SETTINGS_NAMESPACE: &str = "lnvend";
const NODE_NAMESPACE: &str = "nodes";
const KEY_NAMESPACE: &str = "keys";
const UPDATE_NAMESPACE: &str = "update";

const KEY_NAME: &str = "name";
const KEY_DISPENSE_ON_TOUCH: &str = "dispenseOnTouch";
const KEY_BUZZ_ON_DISPENSE: &str = "buzzOnDispense";
const KEY_WIFI: &str = "wifi";
const KEY_CURRENT_UPDATE: &str = "current";

const MAX_BLOB_SIZE: usize = 16 * 1024;

type Blobs = BTreeMap<String, Vec<u8>>;

pub struct NvsStore {
    blobs: Mutex<Blobs>,
    path: Option<PathBuf>,
}

impl NvsStore {
    pub fn in_memory() -> Self {
        info!("NvsStore: in-memory backend");
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Open (or create) a file-backed store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let blobs = match fs::read(&path) {
            Ok(bytes) => postcard::from_bytes::<Blobs>(&bytes)
                .map_err(|e| StorageError::Corrupted(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        info!("NvsStore: {} key(s) from {}", blobs.len(), path.display());
        Ok(Self {
            blobs: Mutex::new(blobs),
            path: Some(path),
        })
    }

    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }

    fn lock(&self) -> MutexGuard<'_, Blobs> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, blobs: &Blobs) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = postcard::to_allocvec(blobs).map_err(|e| StorageError::Io(e.to_string()))?;
        write_atomic(path, &bytes)
    }

    fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>, StorageError> {
        let blobs = self.lock();
        let Some(bytes) = blobs.get(&Self::composite_key(namespace, key)) else {
            return Ok(None);
        };
        postcard::from_bytes(bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupted(format!("{}::{}: {}", namespace, key, e)))
    }

    fn put<T: Serialize + ?Sized>(&self, namespace: &str, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = postcard::to_allocvec(value).map_err(|e| StorageError::Io(e.to_string()))?;
        if bytes.len() > MAX_BLOB_SIZE {
            return Err(StorageError::Io(format!("{}::{} exceeds {} bytes", namespace, key, MAX_BLOB_SIZE)));
        }
        let full_key = Self::composite_key(namespace, key);
        let mut blobs = self.lock();
        let previous = blobs.insert(full_key.clone(), bytes);
        if let Err(e) = self.flush(&blobs) {
            warn!("NvsStore: write of {} failed, rolling back: {}", full_key, e);
            match previous {
                Some(old) => blobs.insert(full_key, old),
                None => blobs.remove(&full_key),
            };
            return Err(e);
        }
        debug!("NvsStore: wrote {}", full_key);
        Ok(())
    }

    /// Returns whether the key existed.
    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let full_key = Self::composite_key(namespace, key);
        let mut blobs = self.lock();
        let Some(old) = blobs.remove(&full_key) else {
            return Ok(false);
        };
        if let Err(e) = self.flush(&blobs) {
            blobs.insert(full_key, old);
            return Err(e);
        }
        Ok(true)
    }

    fn values_in<T: DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>, StorageError> {
        let prefix = Self::composite_key(namespace, "");
        self.lock()
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| postcard::from_bytes(v).map_err(|e| StorageError::Corrupted(format!("{}: {}", k, e))))
            .collect()
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| StorageError::Io(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| StorageError::Io(e.to_string()))
}

// ───────────────────────────────────────────────────────────────
// SettingsStore
// ───────────────────────────────────────────────────────────────

impl SettingsStore for NvsStore {
    fn name(&self) -> Result<Option<String>, StorageError> {
        self.get(SETTINGS_NAMESPACE, KEY_NAME)
    }

    fn set_name(&self, name: &str) -> Result<(), StorageError> {
        self.put(SETTINGS_NAMESPACE, KEY_NAME, name)
    }

    fn dispense_on_touch(&self) -> Result<Option<bool>, StorageError> {
        self.get(SETTINGS_NAMESPACE, KEY_DISPENSE_ON_TOUCH)
    }

    fn set_dispense_on_touch(&self, on: bool) -> Result<(), StorageError> {
        self.put(SETTINGS_NAMESPACE, KEY_DISPENSE_ON_TOUCH, &on)
    }

    fn buzz_on_dispense(&self) -> Result<Option<bool>, StorageError> {
        self.get(SETTINGS_NAMESPACE, KEY_BUZZ_ON_DISPENSE)
    }

    fn set_buzz_on_dispense(&self, on: bool) -> Result<(), StorageError> {
        self.put(SETTINGS_NAMESPACE, KEY_BUZZ_ON_DISPENSE, &on)
    }

    fn wifi(&self) -> Result<Option<Connection>, StorageError> {
        self.get(SETTINGS_NAMESPACE, KEY_WIFI)
    }

    fn set_wifi(&self, connection: &Connection) -> Result<(), StorageError> {
        self.put(SETTINGS_NAMESPACE, KEY_WIFI, connection)
    }

    fn nodes(&self) -> Result<Vec<NodeRecord>, StorageError> {
        self.values_in(NODE_NAMESPACE)
    }

    fn node(&self, id: &str) -> Result<Option<NodeRecord>, StorageError> {
        self.get(NODE_NAMESPACE, id)
    }

    fn put_node(&self, record: &NodeRecord) -> Result<(), StorageError> {
        self.put(NODE_NAMESPACE, &record.id, record)
    }

    fn remove_node(&self, id: &str) -> Result<(), StorageError> {
        if self.delete(NODE_NAMESPACE, id)? {
            Ok(())
        } else {
            Err(StorageError::NotFound)
        }
    }

    fn private_key(&self, service: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.get(KEY_NAMESPACE, service)
    }

    fn set_private_key(&self, service: &str, key: &[u8]) -> Result<(), StorageError> {
        self.put(KEY_NAMESPACE, service, key)
    }

    fn current_update(&self) -> Result<Option<Update>, StorageError> {
        self.get(UPDATE_NAMESPACE, KEY_CURRENT_UPDATE)
    }

    fn set_current_update(&self, update: Option<&Update>) -> Result<(), StorageError> {
        match update {
            Some(update) => self.put(UPDATE_NAMESPACE, KEY_CURRENT_UPDATE, update),
            None => self.delete(UPDATE_NAMESPACE, KEY_CURRENT_UPDATE).map(|_| ()),
        }
    }
}
