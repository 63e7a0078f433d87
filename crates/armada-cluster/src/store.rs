//! Disk-backed metadata store.
//!
//! One pretty-printed JSON file per key under a root directory. Used to
//! persist rescheduling decisions so they survive daemon restarts; never
//! authoritative for live state.

use crate::error::{ClusterError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// JSON-file-per-key store rooted at a single directory.
///
/// Files are written with mode 0600; the root directory is created with
/// mode 0700 if absent.
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Opens (and creates, if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(Self { root })
    }

    /// Persists `value` under `key`, overwriting any previous entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the file cannot be written.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.entry_path(key)?;
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        debug!(key, "store entry saved");
        Ok(())
    }

    /// Loads the entry stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no entry exists, or an error if the file
    /// cannot be read or parsed.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let path = self.entry_path(key)?;
        if !path.exists() {
            return Err(ClusterError::not_found("store entry", key));
        }
        let json = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Removes the entry stored under `key`. Removing a missing key is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the file cannot be removed.
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(key, "store entry removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists all stored keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be read.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(ClusterError::InvalidArgument(format!(
                "invalid store key {key:?}"
            )));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        name: String,
        running: bool,
    }

    #[test]
    fn put_get_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("state")).unwrap();

        let rec = Record {
            name: "web-1".to_string(),
            running: true,
        };
        store.put("abc123", &rec).unwrap();
        let loaded: Record = store.get("abc123").unwrap();
        assert_eq!(loaded, rec);

        assert_eq!(store.list().unwrap(), vec!["abc123".to_string()]);

        store.remove("abc123").unwrap();
        assert!(matches!(
            store.get::<Record>("abc123"),
            Err(ClusterError::NotFound { .. })
        ));
        // Removing again is fine.
        store.remove("abc123").unwrap();
    }

    #[test]
    fn rejects_path_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.put("../evil", &1).is_err());
        assert!(store.put("a/b", &1).is_err());
        assert!(store.put("", &1).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("private");
        let store = Store::open(&root).unwrap();
        store.put("k", &42).unwrap();

        let root_mode = std::fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(root_mode & 0o777, 0o700);
        let file_mode = std::fs::metadata(root.join("k.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
