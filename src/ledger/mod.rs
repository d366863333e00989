/// Ledger storage engine of a bookie
///
/// Entries written by ledger writers are made durable in a write-ahead
/// journal before they are acknowledged, buffered in memory, and moved to
/// the entry log and the Fjall-backed index by periodic checkpoints.
///
/// - `journal`: write-ahead log, the durability boundary
/// - `entry_log`: append-only segment files holding entry data
/// - `index`: entry locations and per-ledger metadata (master key, fence, LAC)
/// - `checkpoint`: the flush-then-truncate protocol
/// - `gc`: removal of deleted ledgers and compaction of sparse segments
/// - `lac`: last-add-confirmed subscriptions
/// - `bookie`: `BookieStorage`, which ties the above together
///
/// ## Usage
///
/// ```rust,ignore
/// use bookie::ledger::{BookieStorage, LedgerStorage, NoDeletions, StorageOptions};
///
/// let storage = BookieStorage::new(
///     StorageOptions::builder()
///         .journal_dir("data/journal")
///         .ledger_dirs(vec!["data/ledgers".into()])
///         .build(),
///     Arc::new(NoDeletions),
/// );
/// storage.start()?;
/// storage.add_entry(envelope.encode())?;
/// let stored = storage.get_entry(42, 0)?;
/// ```

pub mod bookie;
pub mod checkpoint;
pub mod cookie;
pub mod entry_log;
pub mod error;
mod files;
pub mod gc;
pub mod index;
pub mod journal;
pub mod lac;
pub mod memtable;
pub mod partitions;
pub mod types;

pub use bookie::{BookieStorage, LedgerInfo, RecoveryStats, StorageOptions, StorageStatus};
pub use checkpoint::{Checkpoint, CheckpointOutcome, CompletedCheckpoint};
pub use error::{ErrorKind, Result, StorageError};
pub use gc::{DeletedLedgers, GcStats, LedgerDeletionSource, NoDeletions};
pub use journal::LogMark;
pub use lac::LacWatch;
pub use types::{
    Entry, EntryEnvelope, EntryId, EntryLocation, LedgerId, INVALID_ENTRY_ID, LAST_ADD_CONFIRMED,
};

use bytes::Bytes;

/// Storage contract used by the request-serving layer.
///
/// `start` is called once before anything else and `shutdown` at most once
/// afterwards. Every other operation fails with an `Interrupted`-kind error
/// outside that window.
pub trait LedgerStorage: Send + Sync {
    /// Open all components and recover from the journal.
    fn start(&self) -> Result<()>;

    /// Checkpoint everything and release resources. A failure leaves the
    /// on-disk state to be resolved by recovery on the next start.
    fn shutdown(&self) -> Result<()>;

    fn ledger_exists(&self, ledger_id: LedgerId) -> Result<bool>;

    /// Bind a master key to a ledger, creating it. Setting the same key
    /// again is a no-op; a different key is `Unauthorized`.
    fn set_master_key(&self, ledger_id: LedgerId, master_key: &[u8]) -> Result<()>;

    fn read_master_key(&self, ledger_id: LedgerId) -> Result<Bytes>;

    /// Fence a ledger. Returns `false` if it was already fenced.
    fn set_fenced(&self, ledger_id: LedgerId) -> Result<bool>;

    fn is_fenced(&self, ledger_id: LedgerId) -> Result<bool>;

    /// Durably store an encoded [`EntryEnvelope`] and return its entry id.
    fn add_entry(&self, payload: Bytes) -> Result<EntryId>;

    /// Stored form of an entry. `LAST_ADD_CONFIRMED` reads the last entry.
    fn get_entry(&self, ledger_id: LedgerId, entry_id: EntryId) -> Result<Bytes>;

    fn get_last_add_confirmed(&self, ledger_id: LedgerId) -> Result<EntryId>;

    /// Resolve once the ledger's LAC exceeds `previous`; immediately if it
    /// already does.
    fn wait_for_last_add_confirmed_update(
        &self,
        ledger_id: LedgerId,
        previous: EntryId,
    ) -> Result<LacWatch>;

    /// Persist all applied state without moving the checkpoint mark.
    fn flush(&self) -> Result<()>;

    fn new_checkpoint(&self) -> Result<Checkpoint>;

    fn checkpoint(&self, checkpoint: Checkpoint) -> Result<CheckpointOutcome>;

    fn reclaim_disk_space(&self) -> Result<GcStats>;
}
