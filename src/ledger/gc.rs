//! Garbage collection of deleted ledgers and entry log compaction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::entry_log::{frame_len, EntryLog, SegmentInfo};
use super::error::Result;
use super::index::LedgerIndex;
use super::lac::LacNotifier;
use super::memtable::EntryMemTable;
use super::types::{EntryId, EntryLocation, LedgerId};

/// Source of ledger deletions, normally backed by the metadata service.
pub trait LedgerDeletionSource: Send + Sync {
    fn is_deleted(&self, ledger_id: LedgerId) -> bool;
}

/// Deletions pushed in by the process itself.
#[derive(Debug, Default)]
pub struct DeletedLedgers {
    deleted: RwLock<HashSet<LedgerId>>,
}

impl DeletedLedgers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_deleted(&self, ledger_id: LedgerId) -> bool {
        self.deleted.write().insert(ledger_id)
    }
}

impl LedgerDeletionSource for DeletedLedgers {
    fn is_deleted(&self, ledger_id: LedgerId) -> bool {
        self.deleted.read().contains(&ledger_id)
    }
}

/// Nothing is ever deleted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDeletions;

impl LedgerDeletionSource for NoDeletions {
    fn is_deleted(&self, _ledger_id: LedgerId) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub ledgers_deleted: usize,
    pub segments_deleted: usize,
    pub segments_compacted: usize,
    pub entries_relocated: usize,
    pub bytes_reclaimed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SegmentAction {
    Delete,
    Compact,
}

pub struct GarbageCollector {
    entry_log: Arc<EntryLog>,
    index: Arc<LedgerIndex>,
    memtable: Arc<EntryMemTable>,
    lac: LacNotifier,
    deletion: Arc<dyn LedgerDeletionSource>,
    threshold: f64,
}

impl GarbageCollector {
    pub fn new(
        entry_log: Arc<EntryLog>,
        index: Arc<LedgerIndex>,
        memtable: Arc<EntryMemTable>,
        lac: LacNotifier,
        deletion: Arc<dyn LedgerDeletionSource>,
        threshold: f64,
    ) -> Self {
        Self {
            entry_log,
            index,
            memtable,
            lac,
            deletion,
            threshold,
        }
    }

    /// One full cycle. Callers serialise this against checkpoints.
    pub fn run(&self) -> Result<GcStats> {
        let mut stats = GcStats {
            ledgers_deleted: self.delete_ledgers()?,
            ..GcStats::default()
        };

        let usage = self.live_bytes()?;
        let active = self.entry_log.active_segment_id();
        let plan: Vec<(SegmentInfo, SegmentAction)> = self
            .entry_log
            .segments()?
            .into_iter()
            .filter(|segment| segment.id != active)
            .filter_map(|segment| {
                let live = usage.get(&segment.id).copied().unwrap_or(0);
                self.classify(segment, live).map(|action| (segment, action))
            })
            .collect();

        if plan.is_empty() {
            debug!(?stats, "Garbage collection found nothing to reclaim");
            return Ok(stats);
        }

        let compact: HashSet<u64> = plan
            .iter()
            .filter(|(_, action)| *action == SegmentAction::Compact)
            .map(|(segment, _)| segment.id)
            .collect();
        if !compact.is_empty() {
            stats.entries_relocated = self.compact(&compact)?;
            stats.segments_compacted = compact.len();
        }

        let preserved = self.preserve_metadata()?;
        debug!(ledgers = preserved, "Ledger metadata rewritten");

        // Relocated copies must be durable and indexed before any old
        // segment disappears.
        self.entry_log.flush()?;
        self.index.sync()?;

        for (segment, action) in plan {
            if self.entry_log.delete_segment(segment.id)? {
                stats.segments_deleted += 1;
                stats.bytes_reclaimed += segment.data_len;
            }
            debug!(segment_id = segment.id, ?action, "Segment reclaimed");
        }

        info!(
            ledgers_deleted = stats.ledgers_deleted,
            segments_deleted = stats.segments_deleted,
            segments_compacted = stats.segments_compacted,
            entries_relocated = stats.entries_relocated,
            bytes_reclaimed = stats.bytes_reclaimed,
            "Garbage collection completed"
        );
        Ok(stats)
    }

    fn classify(&self, segment: SegmentInfo, live: u64) -> Option<SegmentAction> {
        if live == 0 {
            return Some(SegmentAction::Delete);
        }
        if segment.data_len == 0 {
            return None;
        }
        let ratio = live as f64 / segment.data_len as f64;
        (ratio < self.threshold).then_some(SegmentAction::Compact)
    }

    fn delete_ledgers(&self) -> Result<usize> {
        let mut deleted = 0;
        for ledger_id in self.index.ledger_ids() {
            if !self.deletion.is_deleted(ledger_id) {
                continue;
            }
            self.index.delete_ledger(ledger_id)?;
            let buffered = self.memtable.remove_ledger(ledger_id);
            self.lac.close_ledger(ledger_id);
            debug!(ledger_id, buffered, "Deleted ledger dropped");
            deleted += 1;
        }
        if deleted > 0 {
            self.index.sync()?;
        }
        Ok(deleted)
    }

    /// Bytes each segment still holds for indexed entries.
    fn live_bytes(&self) -> Result<HashMap<u64, u64>> {
        let mut usage = HashMap::new();
        for item in self.index.locations() {
            let (_, _, location) = item?;
            *usage.entry(location.segment_id).or_insert(0) += frame_len(location.length);
        }
        Ok(usage)
    }

    /// Rewrite live entries of `segments` into the active segment.
    fn compact(&self, segments: &HashSet<u64>) -> Result<usize> {
        let live: Vec<(LedgerId, EntryId, EntryLocation)> = self
            .index
            .locations()
            .filter(|item| match item {
                Ok((_, _, location)) => segments.contains(&location.segment_id),
                Err(_) => true,
            })
            .collect::<Result<_>>()?;

        let mut copies = Vec::with_capacity(live.len());
        for (ledger_id, entry_id, old) in live {
            let stored = self.entry_log.read(old)?;
            let new = self.entry_log.append(&stored)?;
            copies.push((ledger_id, entry_id, old, new));
        }
        // The index may only point at copies that are already on disk.
        self.entry_log.flush()?;

        let mut relocated = 0;
        for (ledger_id, entry_id, old, new) in copies {
            if self.index.relocate(ledger_id, entry_id, old, new)? {
                relocated += 1;
            } else {
                warn!(ledger_id, entry_id, "Entry moved during compaction, copy dropped");
            }
        }
        Ok(relocated)
    }

    /// Append the metadata of every live ledger to the active segment, so
    /// none of it lives only in a segment about to be removed.
    fn preserve_metadata(&self) -> Result<usize> {
        let mut written = 0;
        for (ledger_id, meta) in self.index.live_metadata() {
            if let Some(stored) = meta.to_stored(ledger_id) {
                self.entry_log.append(&stored)?;
                written += 1;
            }
        }
        Ok(written)
    }
}
