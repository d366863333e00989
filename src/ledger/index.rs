use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{Result, StorageError};
use super::journal::LogMark;
use super::partitions::{
    decode_ledger_key, decode_location_key, encode_ledger_key, encode_location_key,
    encode_meta_key, LAST_MARK, LEDGERS_PARTITION, LOCATIONS_PARTITION, METADATA_PARTITION,
};
use super::types::{
    Entry, EntryId, EntryLocation, LedgerId, INVALID_ENTRY_ID, METADATA_ENTRY_ID,
};

/// Per-ledger metadata as persisted in the `ledgers` partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMetadata {
    /// `None` until a writer establishes the ledger.
    pub master_key: Option<Vec<u8>>,
    pub fenced: bool,
    pub last_add_confirmed: EntryId,
}

impl Default for LedgerMetadata {
    fn default() -> Self {
        Self {
            master_key: None,
            fenced: false,
            last_add_confirmed: INVALID_ENTRY_ID,
        }
    }
}

const FLAG_FENCED: u8 = 0b01;
const FLAG_HAS_KEY: u8 = 0b10;

impl LedgerMetadata {
    /// Entry log record carrying this metadata, so an index rebuilt from
    /// segments keeps fences and keys after their journal records are gone.
    ///
    /// Body is `flags u8 | master_key`. `None` when there is nothing to keep.
    pub fn to_stored(&self, ledger_id: LedgerId) -> Option<Bytes> {
        if self.master_key.is_none() && !self.fenced {
            return None;
        }
        let key = self.master_key.as_deref().unwrap_or_default();
        let mut flags = 0;
        if self.fenced {
            flags |= FLAG_FENCED;
        }
        if self.master_key.is_some() {
            flags |= FLAG_HAS_KEY;
        }
        let mut body = BytesMut::with_capacity(1 + key.len());
        body.put_u8(flags);
        body.put_slice(key);

        let entry = Entry {
            ledger_id,
            entry_id: METADATA_ENTRY_ID,
            last_add_confirmed: self.last_add_confirmed,
            body: body.freeze(),
        };
        Some(entry.encode())
    }

    pub fn from_stored(stored: Bytes) -> Result<(LedgerId, Self)> {
        let entry = Entry::decode(stored)?;
        if entry.entry_id != METADATA_ENTRY_ID {
            return Err(StorageError::MalformedEntry(format!(
                "entry {} of ledger {} is not a metadata record",
                entry.entry_id, entry.ledger_id
            )));
        }
        let Some((&flags, key)) = entry.body.split_first() else {
            return Err(StorageError::MalformedEntry(format!(
                "metadata record of ledger {} has no flags",
                entry.ledger_id
            )));
        };
        let meta = Self {
            master_key: (flags & FLAG_HAS_KEY != 0).then(|| key.to_vec()),
            fenced: flags & FLAG_FENCED != 0,
            last_add_confirmed: entry.last_add_confirmed,
        };
        Ok((entry.ledger_id, meta))
    }
}

/// In-memory state of one ledger, guarded by its own mutex.
#[derive(Debug, Default)]
pub struct LedgerState {
    pub meta: LedgerMetadata,
    /// False until the ledger has been established by a key or recovered.
    live: bool,
    deleted: bool,
    version: u64,
    persisted_version: u64,
}

impl LedgerState {
    pub fn is_live(&self) -> bool {
        self.live && !self.deleted
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_live(&mut self) {
        if !self.live {
            self.live = true;
            self.mark_dirty();
        }
    }

    /// Raise the LAC, returning whether it moved.
    pub fn advance_lac(&mut self, value: EntryId) -> bool {
        if value > self.meta.last_add_confirmed {
            self.meta.last_add_confirmed = value;
            self.mark_dirty();
            true
        } else {
            false
        }
    }

    pub fn mark_dirty(&mut self) {
        self.version += 1;
    }

    /// Merge metadata recovered from the entry log. Fencing stays set once
    /// seen and later keys replace earlier ones.
    pub fn restore(&mut self, recovered: LedgerMetadata) {
        if recovered.master_key.is_some() && recovered.master_key != self.meta.master_key {
            self.meta.master_key = recovered.master_key;
            self.mark_dirty();
        }
        if recovered.fenced && !self.meta.fenced {
            self.meta.fenced = true;
            self.mark_dirty();
        }
        self.advance_lac(recovered.last_add_confirmed);
        self.set_live();
    }
}

pub type LedgerHandle = Arc<Mutex<LedgerState>>;

/// Metadata of a ledger changed since it was last persisted.
#[derive(Debug, Clone)]
pub struct DirtyLedger {
    pub ledger_id: LedgerId,
    pub meta: LedgerMetadata,
    version: u64,
}

/// Fjall-backed ledger index: entry locations plus per-ledger metadata.
///
/// Ledger metadata is cached in memory and every ledger has its own lock.
/// Master key and fence changes are written through; LAC changes reach disk
/// with the next checkpoint.
pub struct LedgerIndex {
    keyspace: Keyspace,
    locations: PartitionHandle,
    ledgers: PartitionHandle,
    metadata: PartitionHandle,
    cache: RwLock<HashMap<LedgerId, LedgerHandle>>,
}

impl LedgerIndex {
    /// Open or create the index at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening ledger index at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let locations =
            keyspace.open_partition(LOCATIONS_PARTITION, PartitionCreateOptions::default())?;
        let ledgers = keyspace.open_partition(LEDGERS_PARTITION, PartitionCreateOptions::default())?;
        let metadata =
            keyspace.open_partition(METADATA_PARTITION, PartitionCreateOptions::default())?;

        let mut cache = HashMap::new();
        for item in ledgers.iter() {
            let (key, value) = item?;
            let ledger_id = decode_ledger_key(&key).ok_or_else(|| {
                StorageError::corrupt(LEDGERS_PARTITION, "ledger key of unexpected length")
            })?;
            let meta: LedgerMetadata = serde_json::from_slice(&value)?;
            let state = LedgerState {
                meta,
                live: true,
                ..LedgerState::default()
            };
            cache.insert(ledger_id, Arc::new(Mutex::new(state)));
        }

        info!(ledgers = cache.len(), "Ledger index opened");
        Ok(Self {
            keyspace,
            locations,
            ledgers,
            metadata,
            cache: RwLock::new(cache),
        })
    }

    /// Handle of an existing ledger.
    pub fn ledger(&self, ledger_id: LedgerId) -> Option<LedgerHandle> {
        self.cache.read().get(&ledger_id).cloned()
    }

    /// Handle of a ledger, creating a not-yet-live placeholder if unknown.
    pub fn ledger_or_create(&self, ledger_id: LedgerId) -> LedgerHandle {
        if let Some(handle) = self.ledger(ledger_id) {
            return handle;
        }
        self.cache
            .write()
            .entry(ledger_id)
            .or_insert_with(|| Arc::new(Mutex::new(LedgerState::default())))
            .clone()
    }

    /// Drop an unused placeholder left behind by a write that failed before
    /// establishing its ledger. Handles still held elsewhere are kept.
    pub fn forget_placeholder(&self, ledger_id: LedgerId) {
        let mut cache = self.cache.write();
        let unused = cache.get(&ledger_id).is_some_and(|handle| {
            Arc::strong_count(handle) == 1 && {
                let state = handle.lock();
                !state.live && !state.deleted
            }
        });
        if unused {
            cache.remove(&ledger_id);
            debug!(ledger_id, "Placeholder dropped");
        }
    }

    /// Metadata of a live ledger.
    pub fn metadata(&self, ledger_id: LedgerId) -> Option<LedgerMetadata> {
        let handle = self.ledger(ledger_id)?;
        let state = handle.lock();
        state.is_live().then(|| state.meta.clone())
    }

    /// Metadata of every live ledger, ascending by id.
    pub fn live_metadata(&self) -> Vec<(LedgerId, LedgerMetadata)> {
        let mut live: Vec<_> = self
            .cache
            .read()
            .iter()
            .filter_map(|(ledger_id, handle)| {
                let state = handle.lock();
                state.is_live().then(|| (*ledger_id, state.meta.clone()))
            })
            .collect();
        live.sort_unstable_by_key(|(ledger_id, _)| *ledger_id);
        live
    }

    pub fn ledger_ids(&self) -> Vec<LedgerId> {
        let mut ids: Vec<_> = self
            .cache
            .read()
            .iter()
            .filter(|(_, handle)| handle.lock().is_live())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Write one ledger's metadata through to the `ledgers` partition.
    pub fn store_metadata(&self, ledger_id: LedgerId, meta: &LedgerMetadata) -> Result<()> {
        let value = serde_json::to_vec(meta)?;
        self.ledgers.insert(encode_ledger_key(ledger_id), value)?;
        debug!(ledger_id, fenced = meta.fenced, "Stored ledger metadata");
        Ok(())
    }

    /// Ledgers whose metadata changed since their last persist.
    pub fn dirty_ledgers(&self) -> Vec<DirtyLedger> {
        self.cache
            .read()
            .iter()
            .filter_map(|(ledger_id, handle)| {
                let state = handle.lock();
                (state.is_live() && state.version > state.persisted_version).then(|| DirtyLedger {
                    ledger_id: *ledger_id,
                    meta: state.meta.clone(),
                    version: state.version,
                })
            })
            .collect()
    }

    pub fn record_location(
        &self,
        ledger_id: LedgerId,
        entry_id: EntryId,
        location: EntryLocation,
    ) -> Result<()> {
        self.locations.insert(
            encode_location_key(ledger_id, entry_id),
            location.to_bytes().to_vec(),
        )?;
        Ok(())
    }

    /// Record many locations in one atomic batch.
    pub fn record_locations(
        &self,
        locations: &[(LedgerId, EntryId, EntryLocation)],
    ) -> Result<()> {
        if locations.is_empty() {
            return Ok(());
        }
        let mut batch = self.keyspace.batch();
        for (ledger_id, entry_id, location) in locations {
            batch.insert(
                &self.locations,
                encode_location_key(*ledger_id, *entry_id),
                location.to_bytes().to_vec(),
            );
        }
        batch.commit()?;
        Ok(())
    }

    /// Location of an entry, `NoSuchEntry` if it is not indexed.
    pub fn lookup(&self, ledger_id: LedgerId, entry_id: EntryId) -> Result<EntryLocation> {
        match self.locations.get(encode_location_key(ledger_id, entry_id))? {
            Some(value) => EntryLocation::from_bytes(&value).ok_or_else(|| {
                StorageError::corrupt(LOCATIONS_PARTITION, "location of unexpected length")
            }),
            None => Err(StorageError::NoSuchEntry {
                ledger_id,
                entry_id,
            }),
        }
    }

    /// Highest indexed entry id of a ledger.
    pub fn last_entry_id(&self, ledger_id: LedgerId) -> Result<Option<EntryId>> {
        match self.locations.prefix(encode_ledger_key(ledger_id)).next_back() {
            Some(item) => {
                let (key, _) = item?;
                Ok(decode_location_key(&key).map(|(_, entry_id)| entry_id))
            }
            None => Ok(None),
        }
    }

    /// Point an entry at a new location if it still points at `expected`.
    pub fn relocate(
        &self,
        ledger_id: LedgerId,
        entry_id: EntryId,
        expected: EntryLocation,
        new: EntryLocation,
    ) -> Result<bool> {
        match self.lookup(ledger_id, entry_id) {
            Ok(current) if current == expected => {
                self.record_location(ledger_id, entry_id, new)?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Every indexed location, in key order.
    pub fn locations(
        &self,
    ) -> impl Iterator<Item = Result<(LedgerId, EntryId, EntryLocation)>> + '_ {
        self.locations.iter().map(|item| {
            let (key, value) = item?;
            let (ledger_id, entry_id) = decode_location_key(&key).ok_or_else(|| {
                StorageError::corrupt(LOCATIONS_PARTITION, "location key of unexpected length")
            })?;
            let location = EntryLocation::from_bytes(&value).ok_or_else(|| {
                StorageError::corrupt(LOCATIONS_PARTITION, "location of unexpected length")
            })?;
            Ok((ledger_id, entry_id, location))
        })
    }

    /// Drop a ledger's metadata and all of its locations.
    ///
    /// Writers that already hold the ledger's handle observe it as deleted.
    pub fn delete_ledger(&self, ledger_id: LedgerId) -> Result<usize> {
        if let Some(handle) = self.cache.write().remove(&ledger_id) {
            handle.lock().deleted = true;
        }

        let mut batch = self.keyspace.batch();
        let mut removed = 0;
        for item in self.locations.prefix(encode_ledger_key(ledger_id)) {
            let (key, _) = item?;
            batch.remove(&self.locations, key);
            removed += 1;
        }
        batch.remove(&self.ledgers, encode_ledger_key(ledger_id));
        batch.commit()?;

        info!(ledger_id, entries = removed, "Ledger removed from index");
        Ok(removed)
    }

    /// Persist dirty metadata and optionally a new checkpoint mark, then sync.
    ///
    /// Dirty flags are only cleared once the data is on disk, so a failed
    /// persist leaves them for the next attempt.
    pub fn persist(&self, dirty: &[DirtyLedger], mark: Option<LogMark>) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for ledger in dirty {
            batch.insert(
                &self.ledgers,
                encode_ledger_key(ledger.ledger_id),
                serde_json::to_vec(&ledger.meta)?,
            );
        }
        if let Some(mark) = mark {
            batch.insert(
                &self.metadata,
                encode_meta_key(LAST_MARK),
                serde_json::to_vec(&mark)?,
            );
        }
        batch.commit()?;
        self.sync()?;

        let cache = self.cache.read();
        for ledger in dirty {
            if let Some(handle) = cache.get(&ledger.ledger_id) {
                let mut state = handle.lock();
                state.persisted_version = state.persisted_version.max(ledger.version);
            }
        }
        debug!(ledgers = dirty.len(), ?mark, "Index persisted");
        Ok(())
    }

    /// Last completed checkpoint mark, if any checkpoint ever completed.
    pub fn last_mark(&self) -> Result<Option<LogMark>> {
        match self.metadata.get(encode_meta_key(LAST_MARK))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Persist all pending writes to disk
    pub fn sync(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}
