use super::models::Config;
use crate::humanize::ByteSize;
use std::collections::HashSet;
use thiserror::Error;

/// Smallest accepted segment, journal file or buffer size
const MIN_SIZE_LIMIT: ByteSize = ByteSize(4 * 1024);

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("No ledger directories configured (storage.ledger_dirs is empty)")]
    NoLedgerDirs,

    #[error("Ledger directory '{dir}' is listed more than once")]
    DuplicateLedgerDir { dir: String },

    #[error("{field} ({actual}) is below the minimum of {minimum}")]
    SizeLimitTooSmall {
        field: &'static str,
        actual: ByteSize,
        minimum: ByteSize,
    },

    #[error("Interval must be positive: {field} = 0")]
    ZeroInterval { field: &'static str },

    #[error("gc.compaction_threshold must be within 0.0..=1.0, got {0}")]
    InvalidCompactionThreshold(f64),
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_dirs(config)?;
    validate_sizes(config)?;
    validate_intervals(config)?;
    validate_gc(config)?;
    Ok(())
}

fn validate_dirs(config: &Config) -> Result<(), ValidationError> {
    if config.storage.ledger_dirs.is_empty() {
        return Err(ValidationError::NoLedgerDirs);
    }

    let mut seen = HashSet::new();
    for dir in &config.storage.ledger_dirs {
        if !seen.insert(dir) {
            return Err(ValidationError::DuplicateLedgerDir {
                dir: dir.display().to_string(),
            });
        }
    }
    Ok(())
}

fn validate_sizes(config: &Config) -> Result<(), ValidationError> {
    let limits = [
        ("storage.entry_log_size_limit", config.storage.entry_log_size_limit),
        ("storage.journal_max_size", config.storage.journal_max_size),
        ("storage.memtable_limit", config.storage.memtable_limit),
    ];
    for (field, actual) in limits {
        if actual < MIN_SIZE_LIMIT {
            return Err(ValidationError::SizeLimitTooSmall {
                field,
                actual,
                minimum: MIN_SIZE_LIMIT,
            });
        }
    }
    Ok(())
}

fn validate_intervals(config: &Config) -> Result<(), ValidationError> {
    if config.checkpoint.interval_ms == 0 {
        return Err(ValidationError::ZeroInterval {
            field: "checkpoint.interval_ms",
        });
    }
    if config.gc.interval_secs == 0 {
        return Err(ValidationError::ZeroInterval {
            field: "gc.interval_secs",
        });
    }
    Ok(())
}

fn validate_gc(config: &Config) -> Result<(), ValidationError> {
    let threshold = config.gc.compaction_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ValidationError::InvalidCompactionThreshold(threshold));
    }
    Ok(())
}
