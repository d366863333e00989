use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::checkpoint::{Checkpoint, CheckpointCoordinator, CheckpointOutcome};
use super::cookie::{self, Cookie};
use super::entry_log::EntryLog;
use super::error::{Result, StorageError};
use super::gc::{GarbageCollector, GcStats, LedgerDeletionSource};
use super::index::{LedgerIndex, LedgerMetadata, LedgerState};
use super::journal::{Journal, LogMark};
use super::lac::{LacNotifier, LacWatch};
use super::memtable::EntryMemTable;
use super::types::{
    EntryEnvelope, EntryHeader, EntryId, LedgerId, LAST_ADD_CONFIRMED, METADATA_ENTRY_ID,
};
use super::LedgerStorage;
use crate::observability::{MetricsSnapshot, StorageMetrics};
use crate::proto::{JournalRecord, RecordKind};

/// Locations recorded per index batch while rebuilding.
const REBUILD_BATCH: usize = 4096;

/// Everything the engine needs to open its directories.
#[derive(Debug, Clone, bon::Builder)]
pub struct StorageOptions {
    #[builder(into)]
    pub journal_dir: PathBuf,
    pub ledger_dirs: Vec<PathBuf>,
    /// Defaults to `index` under the first ledger dir.
    #[builder(into)]
    pub index_dir: Option<PathBuf>,
    #[builder(default = 1024 * 1024 * 1024)]
    pub entry_log_size_limit: u64,
    #[builder(default = 2 * 1024 * 1024 * 1024)]
    pub journal_max_size: u64,
    #[builder(default = 64 * 1024 * 1024)]
    pub memtable_limit: u64,
    #[builder(default = 0.2)]
    pub compaction_threshold: f64,
    #[builder(default)]
    pub readonly: bool,
}

impl StorageOptions {
    pub fn index_dir(&self) -> PathBuf {
        match (&self.index_dir, self.ledger_dirs.first()) {
            (Some(dir), _) => dir.clone(),
            (None, Some(first)) => first.join("index"),
            (None, None) => self.journal_dir.join("index"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerInfo {
    pub ledger_id: LedgerId,
    pub fenced: bool,
    pub has_master_key: bool,
    pub last_add_confirmed: EntryId,
    pub last_entry_id: Option<EntryId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub state: &'static str,
    pub readonly: bool,
    pub instance_id: Option<String>,
    pub ledgers: usize,
    pub buffered_bytes: u64,
    pub last_checkpoint: Option<LogMark>,
    pub active_segment: Option<u64>,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    pub rebuilt_index: bool,
    pub segments_scanned: usize,
    pub records_replayed: usize,
    pub entries_replayed: usize,
}

enum Lifecycle {
    Created,
    Running(Arc<Engine>),
    Stopped,
}

/// Components opened by `start` and dropped by `shutdown`.
struct Engine {
    cookie: Cookie,
    journal: Arc<Journal>,
    entry_log: Arc<EntryLog>,
    index: Arc<LedgerIndex>,
    memtable: Arc<EntryMemTable>,
    lac: LacNotifier,
    /// Writes hold this shared; checkpoint capture holds it exclusively.
    write_gate: Arc<RwLock<()>>,
    /// Serialises flush, checkpoint and garbage collection.
    maintenance: Mutex<()>,
    coordinator: CheckpointCoordinator,
    gc: GarbageCollector,
}

/// Ledger storage of a single bookie.
pub struct BookieStorage {
    options: StorageOptions,
    deletion: Arc<dyn LedgerDeletionSource>,
    metrics: Arc<StorageMetrics>,
    readonly: AtomicBool,
    checkpoint_requests: Arc<Notify>,
    lifecycle: RwLock<Lifecycle>,
}

impl BookieStorage {
    pub fn new(options: StorageOptions, deletion: Arc<dyn LedgerDeletionSource>) -> Self {
        Self {
            readonly: AtomicBool::new(options.readonly),
            options,
            deletion,
            metrics: Arc::new(StorageMetrics::new()),
            checkpoint_requests: Arc::new(Notify::new()),
            lifecycle: RwLock::new(Lifecycle::Created),
        }
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn metrics(&self) -> Arc<StorageMetrics> {
        self.metrics.clone()
    }

    /// Signalled when the write buffer grows past its limit.
    pub fn checkpoint_requests(&self) -> Arc<Notify> {
        self.checkpoint_requests.clone()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.read(), Lifecycle::Running(_))
    }

    /// Open every component and recover state from the journal.
    pub fn start_with_stats(&self) -> Result<RecoveryStats> {
        let mut lifecycle = self.lifecycle.write();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => return Ok(RecoveryStats::default()),
            Lifecycle::Stopped => return Err(StorageError::NotRunning("storage was shut down")),
        }

        let (engine, stats) = Engine::open(&self.options, self.deletion.clone())?;
        info!(
            instance_id = %engine.cookie.instance_id,
            rebuilt_index = stats.rebuilt_index,
            segments_scanned = stats.segments_scanned,
            records_replayed = stats.records_replayed,
            readonly = self.is_readonly(),
            "Ledger storage started"
        );
        *lifecycle = Lifecycle::Running(Arc::new(engine));
        Ok(stats)
    }

    pub fn status(&self) -> StorageStatus {
        let (state, engine) = match &*self.lifecycle.read() {
            Lifecycle::Created => ("created", None),
            Lifecycle::Running(engine) => ("running", Some(engine.clone())),
            Lifecycle::Stopped => ("stopped", None),
        };
        StorageStatus {
            state,
            readonly: self.is_readonly(),
            instance_id: engine.as_ref().map(|e| e.cookie.instance_id.to_string()),
            ledgers: engine.as_ref().map_or(0, |e| e.index.ledger_ids().len()),
            buffered_bytes: engine.as_ref().map_or(0, |e| e.memtable.size_bytes()),
            last_checkpoint: engine.as_ref().map(|e| e.coordinator.last_mark()),
            active_segment: engine.as_ref().map(|e| e.entry_log.active_segment_id()),
            metrics: self.metrics.snapshot(),
        }
    }

    pub fn ledger_info(&self, ledger_id: LedgerId) -> Result<LedgerInfo> {
        let engine = self.engine()?;
        let meta = engine
            .index
            .metadata(ledger_id)
            .ok_or(StorageError::NoSuchLedger(ledger_id))?;
        Ok(LedgerInfo {
            ledger_id,
            fenced: meta.fenced,
            has_master_key: meta.master_key.is_some(),
            last_add_confirmed: meta.last_add_confirmed,
            last_entry_id: engine.last_entry_id(ledger_id)?,
        })
    }

    fn engine(&self) -> Result<Arc<Engine>> {
        match &*self.lifecycle.read() {
            Lifecycle::Running(engine) => Ok(engine.clone()),
            Lifecycle::Created => Err(StorageError::NotRunning("storage has not been started")),
            Lifecycle::Stopped => Err(StorageError::NotRunning("storage was shut down")),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_readonly() {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    /// Journal a record; a failure turns the node read-only for good.
    fn journal(&self, engine: &Engine, record: JournalRecord) -> Result<LogMark> {
        engine.journal.append(record).inspect_err(|err| {
            self.metrics.journal_failed();
            if !self.readonly.swap(true, Ordering::AcqRel) {
                error!(error = %err, "Journal failed, storage is now read-only");
            }
        })
    }

    /// Journal and adopt the first master key of a ledger.
    fn establish_key(
        &self,
        engine: &Engine,
        ledger_id: LedgerId,
        state: &mut LedgerState,
        key: &[u8],
    ) -> Result<()> {
        self.journal(
            engine,
            JournalRecord::master_key(ledger_id, Bytes::copy_from_slice(key)),
        )?;
        state.meta.master_key = Some(key.to_vec());
        state.set_live();
        state.mark_dirty();
        engine.index.store_metadata(ledger_id, &state.meta)?;
        debug!(ledger_id, "Master key established");
        Ok(())
    }

    fn store_master_key(&self, engine: &Engine, ledger_id: LedgerId, key: &[u8]) -> Result<()> {
        let _gate = engine.write_gate.read();
        let handle = engine.index.ledger_or_create(ledger_id);
        let mut state = handle.lock();
        if state.is_deleted() {
            return Err(StorageError::NoSuchLedger(ledger_id));
        }

        if let Some(existing) = &state.meta.master_key {
            if existing.as_slice() != key {
                return Err(StorageError::Unauthorized(ledger_id));
            }
            return Ok(());
        }
        self.check_writable()?;
        self.establish_key(engine, ledger_id, &mut state, key)
    }

    /// Checks, journals and buffers one entry. Returns the new LAC if it
    /// moved and whether the buffer asks for a checkpoint.
    fn append_entry(
        &self,
        engine: &Engine,
        envelope: &EntryEnvelope,
    ) -> Result<(Option<EntryId>, bool)> {
        let ledger_id = envelope.ledger_id;
        let _gate = engine.write_gate.read();
        let handle = engine.index.ledger_or_create(ledger_id);
        let mut state = handle.lock();
        if state.is_deleted() {
            return Err(StorageError::NoSuchLedger(ledger_id));
        }
        if let Some(key) = &state.meta.master_key {
            if key.as_slice() != envelope.master_key.as_ref() {
                return Err(StorageError::Unauthorized(ledger_id));
            }
        }
        if state.meta.fenced {
            return Err(StorageError::LedgerFenced(ledger_id));
        }
        if state.meta.master_key.is_none() {
            self.establish_key(engine, ledger_id, &mut state, &envelope.master_key)?;
        }

        let stored = envelope.to_entry().encode();
        self.journal(
            engine,
            JournalRecord::entry(ledger_id, envelope.entry_id, stored.clone()),
        )?;
        let over_limit = engine.memtable.insert(ledger_id, envelope.entry_id, stored);
        let advanced = state
            .advance_lac(envelope.last_add_confirmed)
            .then_some(state.meta.last_add_confirmed);
        Ok((advanced, over_limit))
    }

    fn with_maintenance<T>(&self, f: impl FnOnce(&Engine) -> Result<T>) -> Result<T> {
        let engine = self.engine()?;
        let _maintenance = engine.maintenance.lock();
        f(&engine)
    }
}

impl LedgerStorage for BookieStorage {
    fn start(&self) -> Result<()> {
        self.start_with_stats().map(|_| ())
    }

    fn shutdown(&self) -> Result<()> {
        let engine = {
            let mut lifecycle = self.lifecycle.write();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(engine) => engine,
                Lifecycle::Created | Lifecycle::Stopped => return Ok(()),
            }
        };

        let _maintenance = engine.maintenance.lock();
        let checkpoint = engine.coordinator.new_checkpoint();
        let result = engine.coordinator.run(Some(checkpoint));
        engine.lac.close_all();
        match result {
            Ok(outcome) => {
                self.metrics.checkpoint_completed();
                info!(mark = %outcome.mark, "Ledger storage shut down");
                Ok(())
            }
            Err(err) => {
                self.metrics.checkpoint_failed();
                error!(error = %err, "Final checkpoint failed, recovery will replay the journal");
                Err(StorageError::Interrupted(format!(
                    "final checkpoint failed: {}",
                    err
                )))
            }
        }
    }

    fn ledger_exists(&self, ledger_id: LedgerId) -> Result<bool> {
        Ok(self.engine()?.index.metadata(ledger_id).is_some())
    }

    fn set_master_key(&self, ledger_id: LedgerId, master_key: &[u8]) -> Result<()> {
        let engine = self.engine()?;
        if engine.index.ledger(ledger_id).is_none() {
            self.check_writable()?;
        }
        let result = self.store_master_key(&engine, ledger_id, master_key);
        if result.is_err() {
            engine.index.forget_placeholder(ledger_id);
        }
        result
    }

    fn read_master_key(&self, ledger_id: LedgerId) -> Result<Bytes> {
        self.engine()?
            .index
            .metadata(ledger_id)
            .and_then(|meta| meta.master_key)
            .map(Bytes::from)
            .ok_or(StorageError::NoSuchLedger(ledger_id))
    }

    fn set_fenced(&self, ledger_id: LedgerId) -> Result<bool> {
        let engine = self.engine()?;
        let _gate = engine.write_gate.read();
        let handle = engine
            .index
            .ledger(ledger_id)
            .ok_or(StorageError::NoSuchLedger(ledger_id))?;
        let mut state = handle.lock();
        if !state.is_live() {
            return Err(StorageError::NoSuchLedger(ledger_id));
        }
        if state.meta.fenced {
            return Ok(false);
        }

        self.check_writable()?;
        self.journal(&engine, JournalRecord::fence(ledger_id))?;
        state.meta.fenced = true;
        state.mark_dirty();
        engine.index.store_metadata(ledger_id, &state.meta)?;
        info!(ledger_id, "Ledger fenced");
        Ok(true)
    }

    fn is_fenced(&self, ledger_id: LedgerId) -> Result<bool> {
        self.engine()?
            .index
            .metadata(ledger_id)
            .map(|meta| meta.fenced)
            .ok_or(StorageError::NoSuchLedger(ledger_id))
    }

    fn add_entry(&self, payload: Bytes) -> Result<EntryId> {
        let envelope = EntryEnvelope::decode(payload)?;
        let ledger_id = envelope.ledger_id;
        let entry_id = envelope.entry_id;
        let engine = self.engine()?;
        self.check_writable()?;

        let result = self.append_entry(&engine, &envelope);
        if result.is_err() {
            engine.index.forget_placeholder(ledger_id);
        }
        let (advanced, over_limit) = result?;

        if let Some(lac) = advanced {
            engine.lac.notify(ledger_id, lac);
        }
        if over_limit {
            self.checkpoint_requests.notify_one();
        }
        self.metrics.entry_added();
        debug!(ledger_id, entry_id, "Entry added");
        Ok(entry_id)
    }

    fn get_entry(&self, ledger_id: LedgerId, entry_id: EntryId) -> Result<Bytes> {
        let engine = self.engine()?;
        if engine.index.metadata(ledger_id).is_none() {
            return Err(StorageError::NoSuchLedger(ledger_id));
        }

        let entry_id = if entry_id == LAST_ADD_CONFIRMED {
            engine
                .last_entry_id(ledger_id)?
                .ok_or(StorageError::NoSuchEntry {
                    ledger_id,
                    entry_id,
                })?
        } else {
            entry_id
        };

        // Compaction may delete the segment between lookup and read; the
        // index already points at the new copy by then.
        let stored = match engine.read_entry(ledger_id, entry_id) {
            Err(StorageError::SegmentNotFound(segment_id)) => {
                debug!(ledger_id, entry_id, segment_id, "Segment vanished, retrying lookup");
                engine.read_entry(ledger_id, entry_id)?
            }
            other => other?,
        };
        self.metrics.entry_read();
        Ok(stored)
    }

    fn get_last_add_confirmed(&self, ledger_id: LedgerId) -> Result<EntryId> {
        self.engine()?
            .index
            .metadata(ledger_id)
            .map(|meta| meta.last_add_confirmed)
            .ok_or(StorageError::NoSuchLedger(ledger_id))
    }

    fn wait_for_last_add_confirmed_update(
        &self,
        ledger_id: LedgerId,
        previous: EntryId,
    ) -> Result<LacWatch> {
        let engine = self.engine()?;
        let handle = engine
            .index
            .ledger(ledger_id)
            .ok_or(StorageError::NoSuchLedger(ledger_id))?;
        let state = handle.lock();
        if !state.is_live() {
            return Err(StorageError::NoSuchLedger(ledger_id));
        }
        Ok(engine
            .lac
            .subscribe(ledger_id, previous, state.meta.last_add_confirmed))
    }

    fn flush(&self) -> Result<()> {
        self.with_maintenance(|engine| engine.coordinator.run(None).map(|_| ()))
    }

    fn new_checkpoint(&self) -> Result<Checkpoint> {
        Ok(self.engine()?.coordinator.new_checkpoint())
    }

    fn checkpoint(&self, checkpoint: Checkpoint) -> Result<CheckpointOutcome> {
        self.with_maintenance(|engine| {
            match engine.coordinator.run(Some(checkpoint)) {
                Ok(outcome) => {
                    self.metrics.checkpoint_completed();
                    Ok(outcome)
                }
                Err(err) => {
                    self.metrics.checkpoint_failed();
                    warn!(error = %err, "Checkpoint failed, will retry");
                    Err(err)
                }
            }
        })
    }

    fn reclaim_disk_space(&self) -> Result<GcStats> {
        self.with_maintenance(|engine| {
            let stats = engine.gc.run()?;
            self.metrics.gc_completed(stats.bytes_reclaimed);
            Ok(stats)
        })
    }
}

impl Engine {
    fn open(
        options: &StorageOptions,
        deletion: Arc<dyn LedgerDeletionSource>,
    ) -> Result<(Self, RecoveryStats)> {
        let cookie = cookie::verify_or_stamp(&options.journal_dir, &options.ledger_dirs)?;
        let entry_log = Arc::new(EntryLog::open(
            options.ledger_dirs.clone(),
            options.entry_log_size_limit,
        )?);
        let (index, fresh_index) = open_index(&options.index_dir())?;
        let index = Arc::new(index);
        let journal = Arc::new(Journal::open(
            &options.journal_dir,
            options.journal_max_size,
        )?);
        let memtable = Arc::new(EntryMemTable::new(options.memtable_limit));
        let lac = LacNotifier::new();
        let write_gate = Arc::new(RwLock::new(()));

        let mut stats = RecoveryStats::default();
        let active = entry_log.active_segment_id();
        let sealed: Vec<u64> = entry_log
            .segments()?
            .into_iter()
            .map(|segment| segment.id)
            .filter(|id| *id != active)
            .collect();
        if fresh_index && !sealed.is_empty() {
            stats.rebuilt_index = true;
            stats.segments_scanned = rebuild_index(&entry_log, &index, &sealed)?;
        }

        let from = index.last_mark()?.unwrap_or_default();
        let (records, entries) = replay_journal(&journal, &index, &memtable, from)?;
        stats.records_replayed = records;
        stats.entries_replayed = entries;

        let coordinator = CheckpointCoordinator::new(
            journal.clone(),
            entry_log.clone(),
            index.clone(),
            memtable.clone(),
            write_gate.clone(),
            from,
        );
        let gc = GarbageCollector::new(
            entry_log.clone(),
            index.clone(),
            memtable.clone(),
            lac.clone(),
            deletion,
            options.compaction_threshold,
        );

        Ok((
            Self {
                cookie,
                journal,
                entry_log,
                index,
                memtable,
                lac,
                write_gate,
                maintenance: Mutex::new(()),
                coordinator,
                gc,
            },
            stats,
        ))
    }

    fn last_entry_id(&self, ledger_id: LedgerId) -> Result<Option<EntryId>> {
        let buffered = self.memtable.last_entry_id(ledger_id);
        let indexed = self.index.last_entry_id(ledger_id)?;
        Ok(buffered.max(indexed))
    }

    /// Buffer first, then the index. Entries leave the buffer only after
    /// the index points at their flushed copy.
    fn read_entry(&self, ledger_id: LedgerId, entry_id: EntryId) -> Result<Bytes> {
        if let Some(stored) = self.memtable.get(ledger_id, entry_id) {
            return Ok(stored);
        }
        let location = self.index.lookup(ledger_id, entry_id)?;
        self.entry_log.read(location)
    }
}

/// Open the index, moving an unreadable one aside. Returns whether the index
/// started out empty.
fn open_index(dir: &Path) -> Result<(LedgerIndex, bool)> {
    let existed = dir.exists();
    match LedgerIndex::open(dir) {
        Ok(index) => Ok((index, !existed)),
        Err(err @ StorageError::Io(_)) => Err(err),
        Err(err) => {
            let aside = dir.with_extension(format!(
                "corrupt-{}",
                OffsetDateTime::now_utc().unix_timestamp()
            ));
            warn!(
                error = %err,
                moved_to = %aside.display(),
                "Ledger index unreadable, rebuilding"
            );
            fs::rename(dir, &aside)?;
            Ok((LedgerIndex::open(dir)?, true))
        }
    }
}

/// Rebuild locations and ledger metadata by scanning sealed segments in
/// order.
fn rebuild_index(entry_log: &EntryLog, index: &LedgerIndex, segments: &[u64]) -> Result<usize> {
    let mut scanned = 0;
    let mut batch = Vec::with_capacity(REBUILD_BATCH);
    for &segment_id in segments {
        let scan = match entry_log.scan(segment_id) {
            Ok(scan) => scan,
            Err(err @ StorageError::Corrupt { .. }) => {
                warn!(segment_id, error = %err, "Skipping unreadable segment");
                continue;
            }
            Err(err) => return Err(err),
        };
        for frame in scan {
            let (location, stored) = frame?;
            let header = match EntryHeader::parse(&stored) {
                Ok(header) => header,
                Err(err) => {
                    warn!(segment_id, offset = location.offset, error = %err, "Skipping frame");
                    continue;
                }
            };
            let handle = index.ledger_or_create(header.ledger_id);
            let mut state = handle.lock();
            if header.entry_id == METADATA_ENTRY_ID {
                match LedgerMetadata::from_stored(stored) {
                    Ok((_, meta)) => state.restore(meta),
                    Err(err) => {
                        warn!(segment_id, offset = location.offset, error = %err, "Skipping frame");
                    }
                }
                continue;
            }
            state.set_live();
            state.advance_lac(header.last_add_confirmed);
            drop(state);
            batch.push((header.ledger_id, header.entry_id, location));
            if batch.len() >= REBUILD_BATCH {
                index.record_locations(&batch)?;
                batch.clear();
            }
        }
        scanned += 1;
    }
    index.record_locations(&batch)?;
    index.persist(&index.dirty_ledgers(), None)?;
    info!(segments = scanned, ledgers = index.ledger_ids().len(), "Ledger index rebuilt");
    Ok(scanned)
}

/// Re-apply journal records from `from`. Applying a record twice has the
/// same effect as applying it once.
fn replay_journal(
    journal: &Journal,
    index: &LedgerIndex,
    memtable: &EntryMemTable,
    from: LogMark,
) -> Result<(usize, usize)> {
    let mut records = 0;
    let mut entries = 0;
    for item in journal.replay(from)? {
        let (position, record) = item?;
        let ledger_id = record.ledger_id;
        let Ok(kind) = RecordKind::try_from(record.kind) else {
            warn!(%position, kind = record.kind, "Skipping journal record of unknown kind");
            continue;
        };

        let handle = index.ledger_or_create(ledger_id);
        let mut state = handle.lock();
        state.set_live();
        match kind {
            RecordKind::Entry => {
                let header = match EntryHeader::parse(&record.payload) {
                    Ok(header) => header,
                    Err(err) => {
                        warn!(%position, error = %err, "Skipping malformed journal entry");
                        continue;
                    }
                };
                state.advance_lac(header.last_add_confirmed);
                memtable.insert(ledger_id, record.entry_id, record.payload);
                entries += 1;
            }
            RecordKind::MasterKey => {
                if state.meta.master_key.is_none() {
                    state.meta.master_key = Some(record.payload.to_vec());
                    state.mark_dirty();
                    index.store_metadata(ledger_id, &state.meta)?;
                }
            }
            RecordKind::Fence => {
                if !state.meta.fenced {
                    state.meta.fenced = true;
                    state.mark_dirty();
                    index.store_metadata(ledger_id, &state.meta)?;
                }
            }
        }
        records += 1;
    }

    if records > 0 {
        info!(from = %from, records, entries, "Journal replayed");
    }
    Ok((records, entries))
}
