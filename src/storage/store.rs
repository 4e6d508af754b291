// NoteStore - Persistent key-value storage using sled
//
// One database per instance, split into named trees:
// - meta:      instance identity
// - changes, latest, history, by_sector: the change ledger
// - entities:  opaque entity payloads
// - peers:     per-peer sync cursors

use crate::ledger::InstanceId;
use std::path::Path;
use thiserror::Error;

/// Tree names
pub mod trees {
    pub const META: &str = "meta";
    pub const CHANGES: &str = "changes";
    pub const LATEST: &str = "latest";
    pub const HISTORY: &str = "history";
    pub const BY_SECTOR: &str = "by_sector";
    pub const ENTITIES: &str = "entities";
    pub const EXTERNAL: &str = "external";
    pub const PEERS: &str = "peers";
}

/// Keys inside the meta tree
mod keys {
    pub const INSTANCE_ID: &[u8] = b"instance:id";
}

/// Errors from storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// Statistics about the storage
#[derive(Clone, Debug)]
pub struct StorageStats {
    /// Number of keys across all trees
    pub key_count: usize,
    /// Approximate disk size in bytes
    pub disk_size_bytes: u64,
}

/// Persistent store for one instance
///
/// Uses sled for crash-safe, embedded storage.
/// All writes are atomic and durable after flush.
#[derive(Clone)]
pub struct NoteStore {
    db: sled::Db,
}

impl NoteStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    /// Open a store that lives only as long as this process
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    /// Open (or create) a named tree
    pub fn tree(&self, name: &str) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(name)?)
    }

    /// Check if nothing has been written yet
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        for name in [trees::META, trees::CHANGES, trees::ENTITIES, trees::PEERS] {
            if !self.tree(name)?.is_empty() {
                return Ok(false);
            }
        }
        Ok(self.db.is_empty())
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    /// Flush without blocking the async runtime
    pub async fn flush_async(&self) -> Result<(), StoreError> {
        self.db
            .flush_async()
            .await
            .map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> Result<StorageStats, StoreError> {
        let mut key_count = 0;
        for name in self.db.tree_names() {
            key_count += self.db.open_tree(name)?.len();
        }
        Ok(StorageStats {
            key_count,
            disk_size_bytes: self.db.size_on_disk().unwrap_or(0),
        })
    }

    // ========================================================================
    // META
    // ========================================================================

    /// Load the persisted instance id
    pub fn load_instance_id(&self) -> Result<Option<InstanceId>, StoreError> {
        match self.tree(trees::META)?.get(keys::INSTANCE_ID)? {
            Some(bytes) => {
                let id = std::str::from_utf8(&bytes)
                    .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?;
                Ok(Some(InstanceId::new(id)))
            }
            None => Ok(None),
        }
    }

    /// Persist the instance id
    pub fn save_instance_id(&self, id: &InstanceId) -> Result<(), StoreError> {
        self.tree(trees::META)?.insert(keys::INSTANCE_ID, id.as_bytes())?;
        Ok(())
    }

    /// Get the instance id, creating one if it doesn't exist
    pub fn get_or_create_instance_id(&self) -> Result<InstanceId, StoreError> {
        if let Some(id) = self.load_instance_id()? {
            return Ok(id);
        }

        let id = InstanceId::generate();
        self.save_instance_id(&id)?;
        Ok(id)
    }
}
