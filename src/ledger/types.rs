//! Entry envelope, stored entry and index location formats.
//!
//! A writer hands the node an [`EntryEnvelope`]:
//!
//! ```text
//! ledger_id u64 | entry_id i64 | last_add_confirmed i64 | key_len u16 | master_key | body
//! ```
//!
//! The node strips the credential and keeps the [`Entry`] form, which is what
//! the journal, the entry log and readers see:
//!
//! ```text
//! ledger_id u64 | entry_id i64 | last_add_confirmed i64 | body
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{Result, StorageError};

/// Ledger identifier, unique across the system.
pub type LedgerId = u64;

/// Entry identifier within a ledger. Negative values are sentinels.
pub type EntryId = i64;

/// LAC of a ledger nobody has confirmed anything for yet.
pub const INVALID_ENTRY_ID: EntryId = -1;

/// Entry id accepted by reads to mean "the last entry stored for this ledger".
pub const LAST_ADD_CONFIRMED: EntryId = -1;

/// Entry id of ledger metadata records in the entry log. Never indexed.
pub const METADATA_ENTRY_ID: EntryId = i64::MIN;

/// Size of the fixed stored-entry header.
pub const ENTRY_HEADER_LEN: usize = 24;

const ENVELOPE_FIXED_LEN: usize = ENTRY_HEADER_LEN + 2;

/// Write request as produced by a ledger writer.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct EntryEnvelope {
    pub ledger_id: LedgerId,
    pub entry_id: EntryId,
    /// Highest entry the writer knows to be replicated, piggy-backed on this write.
    #[builder(default = INVALID_ENTRY_ID)]
    pub last_add_confirmed: EntryId,
    #[builder(into)]
    pub master_key: Bytes,
    #[builder(into)]
    pub body: Bytes,
}

impl EntryEnvelope {
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(ENVELOPE_FIXED_LEN + self.master_key.len() + self.body.len());
        buf.put_u64(self.ledger_id);
        buf.put_i64(self.entry_id);
        buf.put_i64(self.last_add_confirmed);
        buf.put_u16(self.master_key.len() as u16);
        buf.put_slice(&self.master_key);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse an envelope without copying the key or body.
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < ENVELOPE_FIXED_LEN {
            return Err(StorageError::MalformedEntry(format!(
                "envelope is {} bytes, need at least {}",
                bytes.len(),
                ENVELOPE_FIXED_LEN
            )));
        }
        let ledger_id = bytes.get_u64();
        let entry_id = bytes.get_i64();
        let last_add_confirmed = bytes.get_i64();
        let key_len = bytes.get_u16() as usize;
        if bytes.len() < key_len {
            return Err(StorageError::MalformedEntry(format!(
                "master key of {} bytes truncated to {}",
                key_len,
                bytes.len()
            )));
        }
        let master_key = bytes.split_to(key_len);

        let envelope = Self {
            ledger_id,
            entry_id,
            last_add_confirmed,
            master_key,
            body: bytes,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entry_id < 0 {
            return Err(StorageError::MalformedEntry(format!(
                "entry id {} is negative",
                self.entry_id
            )));
        }
        if self.last_add_confirmed < INVALID_ENTRY_ID {
            return Err(StorageError::MalformedEntry(format!(
                "last add confirmed {} is below {}",
                self.last_add_confirmed, INVALID_ENTRY_ID
            )));
        }
        if self.master_key.len() > u16::MAX as usize {
            return Err(StorageError::MalformedEntry(format!(
                "master key of {} bytes is too long",
                self.master_key.len()
            )));
        }
        Ok(())
    }

    /// The credential-free form kept on disk and served to readers.
    pub fn to_entry(&self) -> Entry {
        Entry {
            ledger_id: self.ledger_id,
            entry_id: self.entry_id,
            last_add_confirmed: self.last_add_confirmed,
            body: self.body.clone(),
        }
    }
}

/// Stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub ledger_id: LedgerId,
    pub entry_id: EntryId,
    pub last_add_confirmed: EntryId,
    pub body: Bytes,
}

impl Entry {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENTRY_HEADER_LEN + self.body.len());
        buf.put_u64(self.ledger_id);
        buf.put_i64(self.entry_id);
        buf.put_i64(self.last_add_confirmed);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        let header = EntryHeader::parse(&bytes)?;
        bytes.advance(ENTRY_HEADER_LEN);
        Ok(Self {
            ledger_id: header.ledger_id,
            entry_id: header.entry_id,
            last_add_confirmed: header.last_add_confirmed,
            body: bytes,
        })
    }
}

/// Leading fields of a stored entry, readable without touching the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub ledger_id: LedgerId,
    pub entry_id: EntryId,
    pub last_add_confirmed: EntryId,
}

impl EntryHeader {
    pub fn parse(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENTRY_HEADER_LEN {
            return Err(StorageError::MalformedEntry(format!(
                "stored entry is {} bytes, header needs {}",
                bytes.len(),
                ENTRY_HEADER_LEN
            )));
        }
        Ok(Self {
            ledger_id: bytes.get_u64(),
            entry_id: bytes.get_i64(),
            last_add_confirmed: bytes.get_i64(),
        })
    }
}

/// Physical position of a stored entry inside the entry log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryLocation {
    pub segment_id: u64,
    /// Offset of the record frame within the segment file.
    pub offset: u64,
    /// Length of the stored entry, excluding the frame header.
    pub length: u32,
}

impl EntryLocation {
    pub const ENCODED_LEN: usize = 20;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.segment_id.to_be_bytes());
        out[8..16].copy_from_slice(&self.offset.to_be_bytes());
        out[16..].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            segment_id: bytes.get_u64(),
            offset: bytes.get_u64(),
            length: bytes.get_u32(),
        })
    }
}
