//! Key-value store implementations
//!
//! [`FileStore`] keeps one file per key and replaces it atomically: the new
//! value goes to a temporary file which is fsynced and renamed over the old
//! one, so a crash leaves either the previous or the new value, never a torn
//! write.

use outbox_types::{Error, KeyValueStore, Result};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, error};

/// In-memory store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save`/`delete` fail, simulating a full or
    /// read-only disk
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Keys currently stored
    pub fn keys(&self) -> Vec<String> {
        self.lock().map(|entries| entries.keys().cloned().collect()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| Error::storage("memory store lock poisoned"))
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage("simulated write failure"));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Directory-backed store, one file per key
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            Error::storage(format!("Failed to create {}: {}", root.display(), e))
        })?;
        debug!("Opened file store at {}", root.display());
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `key`. Bytes outside `[A-Za-z0-9._-]` are written as
    /// `%XX`, so every key maps to its own flat file.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
                name.push(char::from(byte));
            } else {
                name.push_str(&format!("%{:02X}", byte));
            }
        }
        self.root.join(format!("{}.json", name))
    }

    fn sync_dir(&self) -> Result<()> {
        #[cfg(unix)]
        {
            File::open(&self.root)?.sync_all()?;
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(format!("Failed to read '{}': {}", key, e))),
        }
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };

        write().map_err(|e| {
            error!("Failed to persist '{}': {}", key, e);
            let _ = fs::remove_file(&tmp);
            Error::storage(format!("Failed to write '{}': {}", key, e))
        })?;
        self.sync_dir()
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => self.sync_dir(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(format!("Failed to delete '{}': {}", key, e))),
        }
    }
}
