use thiserror::Error;

use super::types::{EntryId, LedgerId};

/// Caller-facing classification of a [`StorageError`].
///
/// Callers must be able to tell "not found", "rejected by policy" and
/// "storage failure" apart without matching on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IoFailure,
    NoSuchLedger,
    NoSuchEntry,
    Unauthorized,
    LedgerFenced,
    Interrupted,
    InvalidRequest,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Journal record decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Corrupt data in {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("Entry log segment {0} not found")]
    SegmentNotFound(u64),

    #[error("No such ledger: {0}")]
    NoSuchLedger(LedgerId),

    #[error("No such entry: ledger={ledger_id} entry={entry_id}")]
    NoSuchEntry {
        ledger_id: LedgerId,
        entry_id: EntryId,
    },

    #[error("Unauthorized access to ledger {0}: master key mismatch")]
    Unauthorized(LedgerId),

    #[error("Ledger {0} is fenced")]
    LedgerFenced(LedgerId),

    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    #[error("Storage is read-only, writes are rejected")]
    ReadOnly,

    #[error("Storage is not running: {0}")]
    NotRunning(&'static str),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Cookie mismatch at {path}: expected {expected}, found {found}")]
    CookieMismatch {
        path: String,
        expected: String,
        found: String,
    },
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NoSuchLedger(_) => ErrorKind::NoSuchLedger,
            StorageError::NoSuchEntry { .. } => ErrorKind::NoSuchEntry,
            StorageError::Unauthorized(_) => ErrorKind::Unauthorized,
            StorageError::LedgerFenced(_) => ErrorKind::LedgerFenced,
            StorageError::MalformedEntry(_) => ErrorKind::InvalidRequest,
            StorageError::NotRunning(_) | StorageError::Interrupted(_) => ErrorKind::Interrupted,
            StorageError::Io(_)
            | StorageError::Fjall(_)
            | StorageError::Serialization(_)
            | StorageError::Decode(_)
            | StorageError::Corrupt { .. }
            | StorageError::SegmentNotFound(_)
            | StorageError::ReadOnly
            | StorageError::CookieMismatch { .. } => ErrorKind::IoFailure,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NoSuchLedger | ErrorKind::NoSuchEntry)
    }

    pub fn is_policy_rejection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unauthorized | ErrorKind::LedgerFenced)
    }

    pub fn is_storage_failure(&self) -> bool {
        self.kind() == ErrorKind::IoFailure
    }

    pub(crate) fn corrupt(location: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::Corrupt {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes_are_disjoint() {
        let not_found = StorageError::NoSuchEntry {
            ledger_id: 1,
            entry_id: 2,
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_policy_rejection());
        assert!(!not_found.is_storage_failure());

        let fenced = StorageError::LedgerFenced(1);
        assert!(fenced.is_policy_rejection());
        assert!(!fenced.is_not_found());

        let io = StorageError::Io(std::io::Error::other("disk gone"));
        assert!(io.is_storage_failure());
        assert!(!io.is_policy_rejection());
    }

    #[test]
    fn test_not_running_is_interrupted() {
        assert_eq!(
            StorageError::NotRunning("shut down").kind(),
            ErrorKind::Interrupted
        );
    }
}
