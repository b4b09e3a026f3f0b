//! Key-value persistence collaborator.
//!
//! The protocol only needs a handful of small records (the bind list, the
//! last-known-good channel, the installed session key), all addressed by
//! fixed string keys. Writes are synchronous; the in-memory state stays
//! authoritative when a write fails.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage backend error: {context}")]
    Backend { context: String },
}

pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn erase(&self, key: &str) -> Result<(), StorageError>;
}

/// Volatile map-backed storage for tests, demos and devices without flash.
pub struct MemStorage {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        MemStorage {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.map.lock().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn erase(&self, key: &str) -> Result<(), StorageError> {
        self.map.lock().remove(key);
        Ok(())
    }
}
