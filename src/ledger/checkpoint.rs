//! Checkpoint protocol.
//!
//! A checkpoint moves through three states, each only reachable from the
//! previous one:
//!
//! 1. [`PendingCheckpoint`]: journal mark, buffered entries and dirty ledger
//!    metadata captured together while writers are held off.
//! 2. [`EntryLogFlushed`]: buffered entries and metadata records of the
//!    dirty ledgers appended to the entry log and forced to disk.
//! 3. [`CompletedCheckpoint`]: locations, metadata and the mark persisted in
//!    the index.
//!
//! Only a [`CompletedCheckpoint`] can truncate the journal.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use super::entry_log::EntryLog;
use super::error::Result;
use super::index::{DirtyLedger, LedgerIndex};
use super::journal::{Journal, LogMark};
use super::memtable::{EntryMemTable, MemSnapshot};
use super::types::{EntryId, EntryLocation, LedgerId};

/// Opaque durability point handed out by `new_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint {
    mark: LogMark,
}

impl Checkpoint {
    pub fn mark(&self) -> LogMark {
        self.mark
    }
}

pub struct PendingCheckpoint {
    mark: LogMark,
    entries: Arc<MemSnapshot>,
    ledgers: Vec<DirtyLedger>,
}

impl PendingCheckpoint {
    /// Append the captured entries to the entry log and force it to disk.
    ///
    /// Ledger metadata goes along as well, since the journal records that
    /// carry it are removed once the checkpoint completes.
    pub fn flush_entry_log(self, entry_log: &EntryLog) -> Result<EntryLogFlushed> {
        let mut locations = Vec::with_capacity(self.entries.len());
        for ((ledger_id, entry_id), stored) in self.entries.iter() {
            let location = entry_log.append(stored)?;
            locations.push((*ledger_id, *entry_id, location));
        }
        for ledger in &self.ledgers {
            if let Some(stored) = ledger.meta.to_stored(ledger.ledger_id) {
                entry_log.append(&stored)?;
            }
        }
        entry_log.flush()?;
        Ok(EntryLogFlushed {
            mark: self.mark,
            locations,
            ledgers: self.ledgers,
        })
    }
}

pub struct EntryLogFlushed {
    mark: LogMark,
    locations: Vec<(LedgerId, EntryId, EntryLocation)>,
    ledgers: Vec<DirtyLedger>,
}

impl EntryLogFlushed {
    /// Point the index at the flushed entries and persist it with the mark.
    pub fn persist_index(self, index: &LedgerIndex) -> Result<CompletedCheckpoint> {
        index.record_locations(&self.locations)?;
        index.persist(&self.ledgers, Some(self.mark))?;
        Ok(CompletedCheckpoint {
            mark: self.mark,
            entries: self.locations.len(),
            ledgers: self.ledgers.len(),
        })
    }
}

/// Proof that everything journaled before `mark` is in the entry log and
/// index.
#[derive(Debug)]
pub struct CompletedCheckpoint {
    mark: LogMark,
    entries: usize,
    ledgers: usize,
}

impl CompletedCheckpoint {
    pub fn mark(&self) -> LogMark {
        self.mark
    }

    #[cfg(test)]
    pub(crate) fn for_test(mark: LogMark) -> Self {
        Self {
            mark,
            entries: 0,
            ledgers: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointOutcome {
    pub mark: LogMark,
    pub entries_flushed: usize,
    pub ledgers_persisted: usize,
    pub journal_files_removed: usize,
}

/// Drives checkpoints across the journal, entry log and index.
///
/// Callers serialise `run` against each other and against compaction.
pub struct CheckpointCoordinator {
    journal: Arc<Journal>,
    entry_log: Arc<EntryLog>,
    index: Arc<LedgerIndex>,
    memtable: Arc<EntryMemTable>,
    write_gate: Arc<RwLock<()>>,
    last_mark: Mutex<LogMark>,
}

impl CheckpointCoordinator {
    pub fn new(
        journal: Arc<Journal>,
        entry_log: Arc<EntryLog>,
        index: Arc<LedgerIndex>,
        memtable: Arc<EntryMemTable>,
        write_gate: Arc<RwLock<()>>,
        last_mark: LogMark,
    ) -> Self {
        Self {
            journal,
            entry_log,
            index,
            memtable,
            write_gate,
            last_mark: Mutex::new(last_mark),
        }
    }

    pub fn new_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            mark: self.journal.mark(),
        }
    }

    pub fn last_mark(&self) -> LogMark {
        *self.last_mark.lock()
    }

    /// Capture state for a checkpoint.
    ///
    /// Writers are excluded only for the capture itself. The persisted mark
    /// never moves backwards, and `None` keeps the current one.
    pub fn begin(&self, target: Option<Checkpoint>) -> PendingCheckpoint {
        let last = self.last_mark();
        let mark = target.map_or(last, |target| target.mark.max(last));

        let _gate = self.write_gate.write();
        PendingCheckpoint {
            mark,
            entries: self.memtable.snapshot(),
            ledgers: self.index.dirty_ledgers(),
        }
    }

    /// Run the full protocol. With a target, journal files before its mark
    /// are removed afterwards; without one this is a plain flush.
    pub fn run(&self, target: Option<Checkpoint>) -> Result<CheckpointOutcome> {
        let pending = self.begin(target);
        debug!(
            mark = %pending.mark,
            entries = pending.entries.len(),
            ledgers = pending.ledgers.len(),
            "Checkpoint started"
        );

        let completed = pending
            .flush_entry_log(&self.entry_log)?
            .persist_index(&self.index)?;
        self.memtable.clear_snapshot();
        *self.last_mark.lock() = completed.mark();

        let journal_files_removed = match target {
            Some(_) => self.journal.truncate_before(&completed)?,
            None => 0,
        };

        let outcome = CheckpointOutcome {
            mark: completed.mark(),
            entries_flushed: completed.entries,
            ledgers_persisted: completed.ledgers,
            journal_files_removed,
        };
        if target.is_some() {
            info!(
                mark = %outcome.mark,
                entries = outcome.entries_flushed,
                ledgers = outcome.ledgers_persisted,
                journal_files_removed,
                "Checkpoint completed"
            );
        } else {
            debug!(entries = outcome.entries_flushed, "Flush completed");
        }
        Ok(outcome)
    }
}
