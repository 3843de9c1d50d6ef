//! Small typed key-value store persisted to a single file.
//!
//! Used for cross-instance state that is not a user preference: install
//! counters, one-shot dialog flags, the update-check bookkeeping. Keys are
//! 64-bit hashes of stable strings; values are a small closed variant. The
//! file carries per-entry modification times, and a newer file on disk
//! (written by another process instance) replaces the in-memory copy on the
//! next reconcile poll: last-writer-wins, readers refresh lazily.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::seams::Clock;
use crate::error::EngineResult;
use crate::logger;

/// Stable 64-bit hash of a key string (first 8 bytes of sha256).
pub fn key_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum StoreValue {
    Bool(bool),
    Int(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    key_hash: u64,
    value: StoreValue,
    /// Unix seconds of the last write to this entry.
    modified_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    entries: Vec<StoredEntry>,
}

pub struct PersistentStore {
    path: PathBuf,
    entries: HashMap<u64, StoredEntry>,
    dirty: bool,
    /// File mtime we last wrote or loaded; used to detect external writers.
    synced_mtime: Option<SystemTime>,
    clock: Arc<dyn Clock>,
}

impl PersistentStore {
    /// Open the store, loading the file if it exists. A corrupt file is
    /// logged and treated as empty rather than failing startup.
    pub fn open(path: PathBuf, clock: Arc<dyn Clock>) -> Self {
        let mut store = Self {
            path,
            entries: HashMap::new(),
            dirty: false,
            synced_mtime: None,
            clock,
        };
        store.load_from_disk();
        store
    }

    fn load_from_disk(&mut self) {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                logger::log_error(
                    &format!("failed to read persistent store {:?}: {}", self.path, e),
                    Some("persistent_store"),
                );
                return;
            }
        };

        match serde_json::from_slice::<StoreFile>(&bytes) {
            Ok(file) => {
                self.entries = file
                    .entries
                    .into_iter()
                    .map(|e| (e.key_hash, e))
                    .collect();
                self.synced_mtime = file_mtime(&self.path);
            }
            Err(e) => {
                logger::log_error(
                    &format!("persistent store {:?} is corrupt: {}", self.path, e),
                    Some("persistent_store"),
                );
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<StoreValue> {
        self.entries.get(&key_hash(key)).map(|e| e.value.clone())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(StoreValue::Bool(b)) => Some(b),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(StoreValue::Int(n)) => Some(n),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: StoreValue) {
        let hash = key_hash(key);
        let modified_at = self.clock.now_utc().timestamp();
        self.entries.insert(
            hash,
            StoredEntry {
                key_hash: hash,
                value,
                modified_at,
            },
        );
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) {
        if self.entries.remove(&key_hash(key)).is_some() {
            self.dirty = true;
        }
    }

    /// Persist pending writes. Records the resulting file mtime so the next
    /// reconcile does not mistake our own write for an external one.
    pub fn flush_if_needed(&mut self) -> EngineResult<bool> {
        if !self.dirty {
            return Ok(false);
        }

        let mut entries: Vec<&StoredEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.key_hash);
        let file = StoreFile {
            entries: entries.into_iter().cloned().collect(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::EngineError::Filesystem(e.into()))?;
        }
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| crate::error::EngineError::Api(e.to_string()))?;
        std::fs::write(&self.path, json)
            .map_err(|e| crate::error::EngineError::Filesystem(e.into()))?;

        self.dirty = false;
        self.synced_mtime = file_mtime(&self.path);
        Ok(true)
    }

    /// Poll step: reload when the file on disk is newer than what we last
    /// synced with (another process instance wrote it). In-memory unflushed
    /// writes lose to the external writer.
    pub fn reconcile_file_mtime(&mut self) -> bool {
        let Some(disk_mtime) = file_mtime(&self.path) else {
            return false;
        };
        let newer = match self.synced_mtime {
            Some(ours) => disk_mtime > ours,
            None => true,
        };
        if newer {
            logger::log_debug(
                &format!("persistent store {:?} changed externally, reloading", self.path),
                Some("persistent_store"),
                None,
            );
            self.entries.clear();
            self.dirty = false;
            self.load_from_disk();
        }
        newer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
