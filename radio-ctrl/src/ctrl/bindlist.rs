//! The persistent bind list.
//!
//! A bounded, dense, insertion-ordered array of (peer address, initiator
//! attribute) pairs. Every mutation writes the whole image back to storage
//! before returning; when the write fails the in-memory list stays
//! authoritative and the error is reported to the caller.

use std::sync::Arc;

use log::{debug, warn};

use crate::storage::{Storage, StorageError};
use crate::{format_addr, RadioAddress};

use super::Attribute;

/// Maximum number of bindings a responder keeps.
pub const BIND_LIST_MAX: usize = 32;

/// Storage key under which the bind list image is persisted.
pub const BIND_LIST_KEY: &str = "bindlist";

const ENTRY_LEN: usize = 8;

/// An authorization record: control messages from `addr` carrying
/// `initiator_attribute` are accepted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BindEntry {
    pub addr: RadioAddress,
    pub initiator_attribute: Attribute,
}

/// Owner of the bind list, lazily loaded from storage on first use.
pub struct BindStore<S: Storage> {
    storage: Arc<S>,
    list: Option<Vec<BindEntry>>,
}

impl<S: Storage> BindStore<S> {
    pub fn new(storage: Arc<S>) -> Self {
        BindStore {
            storage,
            list: None,
        }
    }

    fn list(&mut self) -> &mut Vec<BindEntry> {
        if self.list.is_none() {
            let loaded = match self.storage.get(BIND_LIST_KEY) {
                Ok(Some(bytes)) => match decode_list(&bytes) {
                    Some(entries) => entries,
                    None => {
                        warn!("persisted bind list is corrupt, starting empty");
                        Vec::new()
                    }
                },
                Ok(None) => Vec::new(),
                Err(err) => {
                    warn!("loading bind list failed: {}, starting empty", err);
                    Vec::new()
                }
            };
            debug!("bind list loaded, {} entries", loaded.len());
            self.list = Some(loaded);
        }
        self.list.as_mut().expect("just loaded")
    }

    pub fn len(&mut self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.list().is_empty()
    }

    pub fn is_bound(&mut self, addr: &RadioAddress, attribute: Attribute) -> bool {
        self.list()
            .iter()
            .any(|e| e.addr == *addr && e.initiator_attribute == attribute)
    }

    /// Appends an entry unless the same pair is already present or the list
    /// is at capacity. Returns whether the list changed.
    pub fn insert(&mut self, entry: BindEntry) -> Result<bool, StorageError> {
        if self.is_bound(&entry.addr, entry.initiator_attribute) {
            return Ok(false);
        }
        if self.list().len() >= BIND_LIST_MAX {
            warn!(
                "bind list is full, not adding {} / {:#06x}",
                format_addr(&entry.addr),
                entry.initiator_attribute
            );
            return Ok(false);
        }
        self.list().push(entry);
        self.persist()?;
        Ok(true)
    }

    /// Removes the exact entry, shifting all following entries left so the
    /// list stays dense. Returns whether the list changed.
    pub fn remove(&mut self, entry: &BindEntry) -> Result<bool, StorageError> {
        let list = self.list();
        if let Some(index) = list.iter().position(|e| e == entry) {
            list.remove(index);
            self.persist()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Removes the entry matching the pair, if any, and returns it.
    pub fn remove_matching(
        &mut self,
        addr: &RadioAddress,
        attribute: Attribute,
    ) -> Result<Option<BindEntry>, StorageError> {
        let list = self.list();
        if let Some(index) = list
            .iter()
            .position(|e| e.addr == *addr && e.initiator_attribute == attribute)
        {
            let entry = list.remove(index);
            self.persist()?;
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.list().clear();
        self.persist()
    }

    /// The first `max` entries in insertion order.
    pub fn snapshot(&mut self, max: usize) -> Vec<BindEntry> {
        self.list().iter().take(max).copied().collect()
    }

    fn persist(&mut self) -> Result<(), StorageError> {
        let image = encode_list(self.list.as_deref().unwrap_or(&[]));
        if let Err(err) = self.storage.set(BIND_LIST_KEY, &image) {
            // Memory stays authoritative until the next restart.
            warn!("persisting bind list failed: {}", err);
            return Err(err);
        }
        Ok(())
    }
}

fn encode_list(entries: &[BindEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + entries.len() * ENTRY_LEN);
    bytes.push(entries.len() as u8);
    for entry in entries {
        bytes.extend_from_slice(&entry.addr);
        bytes.extend_from_slice(&entry.initiator_attribute.to_le_bytes());
    }
    bytes
}

fn decode_list(bytes: &[u8]) -> Option<Vec<BindEntry>> {
    let count = *bytes.first()? as usize;
    if count > BIND_LIST_MAX || bytes.len() < 1 + count * ENTRY_LEN {
        return None;
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let chunk = &bytes[1 + i * ENTRY_LEN..1 + (i + 1) * ENTRY_LEN];
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&chunk[..6]);
        entries.push(BindEntry {
            addr,
            initiator_attribute: u16::from_le_bytes([chunk[6], chunk[7]]),
        });
    }
    Some(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn entry(n: u8) -> BindEntry {
        BindEntry {
            addr: [n; 6],
            initiator_attribute: 0x0200 | n as u16,
        }
    }

    fn store() -> (Arc<MemStorage>, BindStore<MemStorage>) {
        let storage = Arc::new(MemStorage::new());
        let store = BindStore::new(Arc::clone(&storage));
        (storage, store)
    }

    #[test]
    fn insert_is_idempotent() {
        let (_, mut store) = store();
        assert!(store.insert(entry(1)).unwrap());
        assert!(store.insert(entry(2)).unwrap());
        assert!(!store.insert(entry(1)).unwrap());
        assert_eq!(store.len(), 2);
        assert_eq!(store.snapshot(8), vec![entry(1), entry(2)]);
    }

    #[test]
    fn removal_compacts_and_persists() {
        let (storage, mut store) = store();
        for n in 1..=4 {
            store.insert(entry(n)).unwrap();
        }
        assert!(store.remove(&entry(2)).unwrap());
        assert_eq!(store.snapshot(8), vec![entry(1), entry(3), entry(4)]);

        let image = storage.get(BIND_LIST_KEY).unwrap().unwrap();
        assert_eq!(decode_list(&image).unwrap(), vec![entry(1), entry(3), entry(4)]);
    }

    #[test]
    fn removing_a_stranger_changes_nothing() {
        let (_, mut store) = store();
        store.insert(entry(1)).unwrap();
        assert!(!store.remove(&entry(9)).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let (_, mut store) = store();
        for n in 0..BIND_LIST_MAX as u8 {
            assert!(store.insert(entry(n)).unwrap());
        }
        assert!(!store.insert(entry(200)).unwrap());
        assert_eq!(store.len(), BIND_LIST_MAX);
    }

    #[test]
    fn list_survives_a_reload() {
        let (storage, mut store) = store();
        store.insert(entry(1)).unwrap();
        store.insert(entry(2)).unwrap();

        let mut reloaded = BindStore::new(storage);
        assert_eq!(reloaded.snapshot(8), vec![entry(1), entry(2)]);
        assert!(reloaded.is_bound(&entry(2).addr, entry(2).initiator_attribute));
    }

    #[test]
    fn corrupt_image_starts_empty() {
        let storage = Arc::new(MemStorage::new());
        storage.set(BIND_LIST_KEY, &[200, 1, 2]).unwrap();
        let mut store = BindStore::new(storage);
        assert_eq!(store.len(), 0);
    }
}
