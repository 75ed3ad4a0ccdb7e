//! Crash-detection flag store.
//!
//! A tiny key/value store holding whether a session is currently active and
//! how many events it has recorded. It is read once before first use and
//! overwritten atomically (temp file, fsync, rename) on every change, so a
//! crash leaves either the old or the new contents on disk, never a torn file.

use crate::StoreResult;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Set at the start of every run, cleared on clean shutdown.
pub const SESSION_ACTIVE_KEY: &str = "session_active";

/// Last checkpointed event count of the running session.
pub const LAST_EVENT_COUNT_KEY: &str = "last_event_count";

/// Small persisted key/value store.
pub trait SessionFlagStore: Send + Sync {
    /// Retrieve a value.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store a value.
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Delete a value. Returns whether it existed.
    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Read a boolean flag; absent or unparsable reads as false.
    fn get_flag(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.as_deref() == Some("true"))
    }

    fn set_flag(&self, key: &str, value: bool) -> StoreResult<()> {
        self.set(key, if value { "true" } else { "false" })
    }

    /// Read a counter; absent or unparsable reads as zero.
    fn get_counter(&self, key: &str) -> StoreResult<u64> {
        Ok(self
            .get(key)?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    fn set_counter(&self, key: &str, value: u64) -> StoreResult<()> {
        self.set(key, &value.to_string())
    }
}

/// JSON-file backed flag store.
pub struct FileSessionFlagStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileSessionFlagStore {
    /// Load the store from `path`. A missing file starts empty; a corrupt
    /// file is logged and treated as empty.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let values = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Session flag file unreadable, starting fresh");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_vec_pretty(values)?;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl SessionFlagStore for FileSessionFlagStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut values = self.values.lock();
        let existed = values.remove(key).is_some();
        if existed {
            self.persist(&values)?;
        }
        Ok(existed)
    }
}

/// In-memory flag store for tests and ephemeral pipelines.
#[derive(Default)]
pub struct MemorySessionFlagStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySessionFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionFlagStore for MemorySessionFlagStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.values.lock().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");

        {
            let store = FileSessionFlagStore::open(&path).unwrap();
            store.set_flag(SESSION_ACTIVE_KEY, true).unwrap();
            store.set_counter(LAST_EVENT_COUNT_KEY, 42).unwrap();
        }

        let reopened = FileSessionFlagStore::open(&path).unwrap();
        assert!(reopened.get_flag(SESSION_ACTIVE_KEY).unwrap());
        assert_eq!(reopened.get_counter(LAST_EVENT_COUNT_KEY).unwrap(), 42);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileSessionFlagStore::open(&dir.path().join("absent.json")).unwrap();
        assert!(!store.get_flag(SESSION_ACTIVE_KEY).unwrap());
        assert_eq!(store.get_counter(LAST_EVENT_COUNT_KEY).unwrap(), 0);
    }

    #[test]
    fn test_file_store_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FileSessionFlagStore::open(&path).unwrap();
        assert_eq!(store.get(SESSION_ACTIVE_KEY).unwrap(), None);

        store.set_flag(SESSION_ACTIVE_KEY, false).unwrap();
        let reopened = FileSessionFlagStore::open(&path).unwrap();
        assert_eq!(reopened.get(SESSION_ACTIVE_KEY).unwrap().as_deref(), Some("false"));
    }

    #[test]
    fn test_delete_reports_existence() {
        let store = MemorySessionFlagStore::new();
        store.set("k", "v").unwrap();
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
    }

    #[test]
    fn test_counter_ignores_garbage() {
        let store = MemorySessionFlagStore::new();
        store.set(LAST_EVENT_COUNT_KEY, "many").unwrap();
        assert_eq!(store.get_counter(LAST_EVENT_COUNT_KEY).unwrap(), 0);
    }
}
