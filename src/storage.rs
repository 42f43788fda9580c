//! Session state storage
//!
//! Persists one named session record so a session survives host restarts.
//! [`FileStateStore`] writes a flat JSON file; [`MemoryStateStore`] keeps the
//! record in process.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::{Error, Result};

/// Persistence medium for a single named session record
pub trait StateStore: Send + Sync + 'static {
    /// Read the record, `None` if nothing has been persisted
    fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Overwrite the record
    fn save(&self, bytes: &[u8]) -> Result<()>;

    /// Whether a record currently exists
    fn exists(&self) -> bool;

    /// Remove the record; removing a missing record is not an error
    fn delete(&self) -> Result<()>;
}

/// Flat-file state store (`<dir>/<record>.json`)
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Create a store for `record` under `base_dir`, creating the directory
    pub fn new(base_dir: &Path, record: &str) -> Result<Self> {
        if !base_dir.exists() {
            fs::create_dir_all(base_dir)
                .map_err(|e| Error::Storage(format!("Failed to create state dir: {e}")))?;
        }

        Ok(Self {
            path: base_dir.join(format!("{record}.json")),
        })
    }

    /// Store at the location named by the session config
    pub fn for_config(config: &SessionConfig) -> Result<Self> {
        Self::new(&config.resolve_state_dir()?, &config.state_record)
    }

    /// Store for one of many users sharing a directory, named by a hash of `key`
    pub fn keyed(base_dir: &Path, record: &str, key: &str) -> Result<Self> {
        Self::new(base_dir, &format!("{record}_{}", storage_key(key)))
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No persisted session state");
            return Ok(None);
        }

        fs::read(&self.path)
            .map(Some)
            .map_err(|e| Error::Storage(format!("Failed to read state file: {e}")))
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        fs::write(&self.path, bytes)
            .map_err(|e| Error::Storage(format!("Failed to write state file: {e}")))?;

        // Owner read/write only: the record holds bearer and refresh tokens
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(&self.path, perms);
        }

        debug!(path = %self.path.display(), "Saved session state");
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .map_err(|e| Error::Storage(format!("Failed to delete state file: {e}")))?;
            info!(path = %self.path.display(), "Deleted persisted session state");
        }

        Ok(())
    }
}

/// In-process state store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    record: Mutex<Option<Vec<u8>>>,
    writes: Mutex<usize>,
}

impl MemoryStateStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a record
    #[must_use]
    pub fn with_record(bytes: Vec<u8>) -> Self {
        Self {
            record: Mutex::new(Some(bytes)),
            writes: Mutex::new(0),
        }
    }

    /// Number of `save` calls so far
    #[must_use]
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }

    /// Copy of the current record
    #[must_use]
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.record.lock().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.record.lock().clone())
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        *self.record.lock() = Some(bytes.to_vec());
        *self.writes.lock() += 1;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.record.lock().is_some()
    }

    fn delete(&self) -> Result<()> {
        self.record.lock().take();
        Ok(())
    }
}

/// Short stable file-name key for an arbitrary identifier
fn storage_key(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    hex::encode(hash)[..16].to_string()
}
