use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use tracing::warn;

use crate::error::TrackerError;

/// Raw string key/value storage shared by every component on a device.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, TrackerError>;

    fn set(&self, key: &str, value: String) -> Result<(), TrackerError>;

    /// Returns the removed value; only one of several concurrent callers sees
    /// `Some`. The entry is gone even when persisting the removal fails.
    fn remove(&self, key: &str) -> Result<Option<String>, TrackerError>;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, TrackerError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: String) -> Result<(), TrackerError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<String>, TrackerError> {
        Ok(self.entries.remove(key).map(|(_, value)| value))
    }
}

/// JSON file backed storage that survives restarts. The whole map is
/// rewritten on every mutation through a temp file and a rename.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: DashMap<String, String>,
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Opens `path`; a missing or corrupt file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let path = path.into();
        let entries = DashMap::new();

        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(map) => {
                    for (key, value) in map {
                        entries.insert(key, value);
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "session file unreadable, starting empty");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(TrackerError::Storage(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                TrackerError::Storage(format!("failed to create {}: {err}", parent.display()))
            })?;
        }

        Ok(Self {
            path,
            entries,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), TrackerError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TrackerError::Storage("session file lock poisoned".to_string()))?;

        let snapshot: HashMap<String, String> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let body = serde_json::to_string_pretty(&snapshot)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|err| {
                TrackerError::Storage(format!("failed to write {}: {err}", self.path.display()))
            })
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, TrackerError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: String) -> Result<(), TrackerError> {
        self.entries.insert(key.to_string(), value);
        self.persist()
    }

    fn remove(&self, key: &str) -> Result<Option<String>, TrackerError> {
        let removed = self.entries.remove(key).map(|(_, value)| value);
        if removed.is_some() {
            if let Err(err) = self.persist() {
                warn!(key, error = %err, "session removal not persisted");
            }
        }
        Ok(removed)
    }
}
