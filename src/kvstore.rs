//! Key-value storage for session state.
//!
//! The session persists small records (resolver statistics, backend login
//! state) through the [`KeyValueStore`] trait. [`FileSystemStore`] is the
//! production implementation, writing one file per key inside the session
//! state directory. [`MemoryStore`] backs tests and ephemeral sessions.
//!
//! Values are opaque byte strings; callers layer their own encoding
//! (typically JSON) on top.
//!
//! # Example
//!
//! ```rust,no_run
//! use netprobe_rs::kvstore::{FileSystemStore, KeyValueStore};
//!
//! # fn example() -> netprobe_rs::Result<()> {
//! let store = FileSystemStore::new(std::path::Path::new("/tmp/state"))?;
//! store.set("greeting", b"hello")?;
//! assert_eq!(store.get("greeting")?, b"hello");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// A store mapping string keys to opaque byte values.
///
/// Implementations must be safe for shared use: the session holds the store
/// behind an `Arc` and hands it to the resolver and backend client.
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KvStore`] if there is no such key or the value
    /// cannot be read.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// Filesystem-backed [`KeyValueStore`] writing one file per key.
///
/// The directory is created if missing. Keys map directly to file names, so
/// callers should use simple dotted names such as `orchestra.state`.
pub struct FileSystemStore {
    basedir: PathBuf,
}

impl FileSystemStore {
    /// Creates a store rooted at `basedir`, creating the directory with
    /// restrictive permissions if it does not exist.
    pub fn new(basedir: &Path) -> Result<Self> {
        fs::create_dir_all(basedir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(basedir, perms)?;
        }
        Ok(Self {
            basedir: basedir.to_path_buf(),
        })
    }

    fn filepath(&self, key: &str) -> PathBuf {
        self.basedir.join(key)
    }
}

impl KeyValueStore for FileSystemStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        fs::read(self.filepath(key))
            .map_err(|e| Error::KvStore(format!("cannot read {}: {}", key, e)))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        fs::write(self.filepath(key), value)
            .map_err(|e| Error::KvStore(format!("cannot write {}: {}", key, e)))
    }
}

/// In-memory [`KeyValueStore`] for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let map = self.map.lock().unwrap();
        map.get(key)
            .cloned()
            .ok_or_else(|| Error::KvStore(format!("no such key: {}", key)))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
