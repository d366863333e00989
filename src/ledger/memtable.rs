//! In-memory buffer of acknowledged entries not yet in the entry log.
//!
//! Writes go to the active table. A checkpoint moves the active table into
//! the snapshot, flushes the snapshot, and clears it once the index points at
//! the flushed copies. Readers look at both tables, so an acknowledged entry
//! is visible at every step.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::types::{EntryId, LedgerId};

pub type EntryKey = (LedgerId, EntryId);
pub type MemSnapshot = BTreeMap<EntryKey, Bytes>;

pub struct EntryMemTable {
    tables: RwLock<Tables>,
    limit: u64,
}

#[derive(Default)]
struct Tables {
    active: MemSnapshot,
    active_bytes: u64,
    snapshot: Arc<MemSnapshot>,
    snapshot_bytes: u64,
}

impl EntryMemTable {
    pub fn new(limit: u64) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            limit,
        }
    }

    /// Buffer a stored entry. Returns `true` once the buffer is over its limit.
    pub fn insert(&self, ledger_id: LedgerId, entry_id: EntryId, stored: Bytes) -> bool {
        let mut tables = self.tables.write();
        let len = stored.len() as u64;
        if let Some(previous) = tables.active.insert((ledger_id, entry_id), stored) {
            tables.active_bytes -= previous.len() as u64;
        }
        tables.active_bytes += len;
        tables.active_bytes + tables.snapshot_bytes > self.limit
    }

    pub fn get(&self, ledger_id: LedgerId, entry_id: EntryId) -> Option<Bytes> {
        let tables = self.tables.read();
        let key = (ledger_id, entry_id);
        tables
            .active
            .get(&key)
            .or_else(|| tables.snapshot.get(&key))
            .cloned()
    }

    /// Highest buffered entry id of a ledger.
    pub fn last_entry_id(&self, ledger_id: LedgerId) -> Option<EntryId> {
        let tables = self.tables.read();
        let range = (ledger_id, 0)..=(ledger_id, EntryId::MAX);
        let active = tables.active.range(range.clone()).next_back();
        let snapshot = tables.snapshot.range(range).next_back();
        active
            .into_iter()
            .chain(snapshot)
            .map(|((_, entry_id), _)| *entry_id)
            .max()
    }

    /// Move everything buffered into the snapshot and return it.
    ///
    /// A snapshot left over from a failed flush is kept and extended, so its
    /// entries are retried.
    pub fn snapshot(&self) -> Arc<MemSnapshot> {
        let mut tables = self.tables.write();
        let mut active = std::mem::take(&mut tables.active);
        let moved = std::mem::take(&mut tables.active_bytes);
        Arc::make_mut(&mut tables.snapshot).append(&mut active);
        tables.snapshot_bytes += moved;
        Arc::clone(&tables.snapshot)
    }

    /// Drop the snapshot after its entries reached the entry log and index.
    pub fn clear_snapshot(&self) {
        let mut tables = self.tables.write();
        tables.snapshot = Arc::default();
        tables.snapshot_bytes = 0;
    }

    /// Forget every buffered entry of a ledger.
    pub fn remove_ledger(&self, ledger_id: LedgerId) -> usize {
        let mut tables = self.tables.write();
        let range = (ledger_id, 0)..=(ledger_id, EntryId::MAX);

        let keys: Vec<_> = tables.active.range(range.clone()).map(|(k, _)| *k).collect();
        for key in &keys {
            if let Some(stored) = tables.active.remove(key) {
                tables.active_bytes -= stored.len() as u64;
            }
        }

        let snapshot_keys: Vec<_> = tables.snapshot.range(range).map(|(k, _)| *k).collect();
        if !snapshot_keys.is_empty() {
            let mut freed = 0;
            let snapshot = Arc::make_mut(&mut tables.snapshot);
            for key in &snapshot_keys {
                if let Some(stored) = snapshot.remove(key) {
                    freed += stored.len() as u64;
                }
            }
            tables.snapshot_bytes -= freed;
        }
        keys.len() + snapshot_keys.len()
    }

    pub fn size_bytes(&self) -> u64 {
        let tables = self.tables.read();
        tables.active_bytes + tables.snapshot_bytes
    }

    pub fn is_empty(&self) -> bool {
        let tables = self.tables.read();
        tables.active.is_empty() && tables.snapshot.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_stay_visible_through_snapshot() {
        let memtable = EntryMemTable::new(1024);
        memtable.insert(1, 0, Bytes::from_static(b"A"));

        let snapshot = memtable.snapshot();
        assert_eq!(snapshot.len(), 1);
        memtable.insert(1, 1, Bytes::from_static(b"B"));

        assert_eq!(memtable.get(1, 0), Some(Bytes::from_static(b"A")));
        assert_eq!(memtable.get(1, 1), Some(Bytes::from_static(b"B")));
        assert_eq!(memtable.last_entry_id(1), Some(1));

        memtable.clear_snapshot();
        assert_eq!(memtable.get(1, 0), None);
        assert_eq!(memtable.get(1, 1), Some(Bytes::from_static(b"B")));
    }

    #[test]
    fn test_failed_flush_keeps_snapshot() {
        let memtable = EntryMemTable::new(1024);
        memtable.insert(1, 0, Bytes::from_static(b"A"));
        memtable.snapshot();
        memtable.insert(1, 1, Bytes::from_static(b"B"));

        let retried = memtable.snapshot();
        let keys: Vec<_> = retried.keys().copied().collect();
        assert_eq!(keys, vec![(1, 0), (1, 1)]);
    }

    #[test]
    fn test_limit_reports_pressure() {
        let memtable = EntryMemTable::new(4);
        assert!(!memtable.insert(1, 0, Bytes::from_static(b"abc")));
        assert!(memtable.insert(1, 1, Bytes::from_static(b"de")));
        assert_eq!(memtable.size_bytes(), 5);
    }

    #[test]
    fn test_remove_ledger() {
        let memtable = EntryMemTable::new(1024);
        memtable.insert(1, 0, Bytes::from_static(b"A"));
        memtable.insert(2, 0, Bytes::from_static(b"B"));
        memtable.snapshot();
        memtable.insert(1, 1, Bytes::from_static(b"C"));

        assert_eq!(memtable.remove_ledger(1), 2);
        assert_eq!(memtable.last_entry_id(1), None);
        assert_eq!(memtable.get(2, 0), Some(Bytes::from_static(b"B")));
        assert_eq!(memtable.size_bytes(), 1);
    }
}
