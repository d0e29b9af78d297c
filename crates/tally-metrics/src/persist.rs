//! JSON snapshot files backing the in-memory stores.
//!
//! The batch CLI runs as short-lived processes, so each store can load its
//! state from a snapshot on start and write it back after mutation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{MetricsError, Result};

/// A named JSON snapshot under a state directory.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Creates a handle for `<dir>/<name>.json`. Nothing is read yet.
    #[must_use]
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{name}.json")),
        }
    }

    /// The snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot, or the default value if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the file exists but cannot be read or parsed.
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot, starting empty");
                return Ok(T::default());
            }
            Err(e) => {
                return Err(MetricsError::Persistence {
                    reason: format!("failed to read '{}': {e}", self.path.display()),
                })
            }
        };
        serde_json::from_str(&content).map_err(|e| MetricsError::Persistence {
            reason: format!("failed to parse '{}': {e}", self.path.display()),
        })
    }

    /// Writes the snapshot atomically: a temporary file renamed into place.
    ///
    /// A crash mid-write leaves the previous snapshot intact.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` on any I/O or serialization failure.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let io_err = |e: std::io::Error| MetricsError::Persistence {
            reason: format!("failed to write '{}': {e}", self.path.display()),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_vec(value).map_err(|e| MetricsError::Persistence {
            reason: format!("failed to serialize '{}': {e}", self.path.display()),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!(path = %self.path.display(), "snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "absent");
        let loaded: BTreeMap<String, u64> = store.load().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "state");
        let mut data = BTreeMap::new();
        data.insert("hourly".to_string(), 3_u64);
        store.save(&data).unwrap();

        let reopened = JsonStore::new(dir.path(), "state");
        let loaded: BTreeMap<String, u64> = reopened.load().unwrap();
        assert_eq!(loaded, data);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "bad");
        fs::write(store.path(), "{not json").unwrap();
        let loaded: Result<BTreeMap<String, u64>> = store.load();
        assert!(matches!(loaded, Err(MetricsError::Persistence { .. })));
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(&dir.path().join("nested/deeper"), "x");
        store.save(&vec![1, 2, 3]).unwrap();
        assert!(store.path().exists());
    }
}
