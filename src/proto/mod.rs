//! Protobuf message types persisted by the journal.
//!
//! ```rust,ignore
//! use bookie::proto::{JournalRecord, RecordKind};
//! use prost::Message;
//!
//! let record = JournalRecord::fence(42);
//! let bytes = record.encode_to_vec();
//! let decoded = JournalRecord::decode(&bytes[..])?;
//! assert_eq!(decoded.kind(), RecordKind::Fence);
//! ```

use bytes::Bytes;

/// One accepted mutation, in the order the node acknowledged it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JournalRecord {
    /// Monotonic per-node sequence number, assigned by the journal.
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(enumeration = "RecordKind", tag = "2")]
    pub kind: i32,
    #[prost(uint64, tag = "3")]
    pub ledger_id: u64,
    #[prost(int64, tag = "4")]
    pub entry_id: i64,
    /// Stored entry for `Entry`, the master key for `MasterKey`, empty for `Fence`.
    #[prost(bytes = "bytes", tag = "5")]
    pub payload: ::prost::bytes::Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RecordKind {
    Entry = 0,
    MasterKey = 1,
    Fence = 2,
}

impl JournalRecord {
    pub fn entry(ledger_id: u64, entry_id: i64, stored: Bytes) -> Self {
        Self {
            seq: 0,
            kind: RecordKind::Entry as i32,
            ledger_id,
            entry_id,
            payload: stored,
        }
    }

    pub fn master_key(ledger_id: u64, key: Bytes) -> Self {
        Self {
            seq: 0,
            kind: RecordKind::MasterKey as i32,
            ledger_id,
            entry_id: -1,
            payload: key,
        }
    }

    pub fn fence(ledger_id: u64) -> Self {
        Self {
            seq: 0,
            kind: RecordKind::Fence as i32,
            ledger_id,
            entry_id: -1,
            payload: Bytes::new(),
        }
    }
}
