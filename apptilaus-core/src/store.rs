//! Persistent marker store
//!
//! A minimal get/set string store that survives process restarts. The client
//! only keeps one value in it: the timestamp of the last successful
//! install/session registration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Key under which the last session registration timestamp is stored
pub const LAST_SESSION_KEY: &str = "last_session_registered";

/// Persistent string key-value store.
pub trait MarkerStore: Send + Sync {
    /// Returns the stored value, or `default` if the key is absent
    fn get_string(&self, key: &str, default: &str) -> String;

    /// Stores a value; durable only after [`MarkerStore::flush`]
    fn set_string(&self, key: &str, value: &str);

    /// Persist pending writes
    fn flush(&self) -> Result<()>;
}

/// In-process store; values are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn get_string(&self, key: &str, default: &str) -> String {
        lock(&self.values)
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn set_string(&self, key: &str, value: &str) {
        lock(&self.values).insert(key.to_string(), value.to_string());
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Store backed by a JSON object file.
///
/// Values are loaded once on open. `flush` rewrites the whole file through a
/// temporary sibling and a rename, so readers never observe a partial write.
#[derive(Debug)]
pub struct FileMarkerStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileMarkerStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// A missing file is an empty store; a corrupt one is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Marker file is corrupt, starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove a key; durable after `flush`
    pub fn remove(&self, key: &str) {
        lock(&self.values).remove(key);
    }
}

impl MarkerStore for FileMarkerStore {
    fn get_string(&self, key: &str, default: &str) -> String {
        lock(&self.values)
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn set_string(&self, key: &str, value: &str) {
        lock(&self.values).insert(key.to_string(), value.to_string());
    }

    fn flush(&self) -> Result<()> {
        // Serialize under the lock so concurrent flushes write complete snapshots
        let values = lock(&self.values);
        let content = serde_json::to_string_pretty(&*values)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            Error::Store(format!(
                "failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

/// Lock a value map, recovering from a poisoned lock.
fn lock<T>(values: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
