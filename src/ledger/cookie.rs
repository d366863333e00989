//! Instance cookie.
//!
//! Written to the journal directory and every ledger directory on first
//! start. A later start with a directory that is missing its cookie, or
//! carries another node's, is refused.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::error::{Result, StorageError};

pub const COOKIE_FILE: &str = "COOKIE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub instance_id: Uuid,
    pub ledger_dirs: usize,
    pub created_at: String,
}

impl Cookie {
    fn generate(ledger_dirs: usize) -> Result<Self> {
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| StorageError::Io(io::Error::other(e)))?;
        Ok(Self {
            instance_id: Uuid::new_v4(),
            ledger_dirs,
            created_at,
        })
    }

    fn read(dir: &Path) -> Result<Option<Self>> {
        match fs::read(dir.join(COOKIE_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("{}.tmp", COOKIE_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, dir.join(COOKIE_FILE))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} ({} ledger dirs)", self.instance_id, self.ledger_dirs)
    }
}

/// Check the cookie in every directory, stamping a new one on first start.
pub fn verify_or_stamp(journal_dir: &Path, ledger_dirs: &[PathBuf]) -> Result<Cookie> {
    let dirs: Vec<&Path> = std::iter::once(journal_dir)
        .chain(ledger_dirs.iter().map(PathBuf::as_path))
        .collect();

    let mut found = Vec::with_capacity(dirs.len());
    for dir in &dirs {
        found.push(Cookie::read(dir)?);
    }

    let Some(reference) = found.iter().flatten().next().cloned() else {
        let cookie = Cookie::generate(ledger_dirs.len())?;
        for dir in &dirs {
            cookie.write(dir)?;
        }
        info!(instance_id = %cookie.instance_id, "Stamped new instance cookie");
        return Ok(cookie);
    };

    for (dir, cookie) in dirs.iter().zip(&found) {
        match cookie {
            Some(cookie) if *cookie == reference => {}
            Some(cookie) => {
                return Err(mismatch(dir, reference.describe(), cookie.describe()));
            }
            None => return Err(mismatch(dir, reference.describe(), "no cookie".into())),
        }
    }
    if reference.ledger_dirs != ledger_dirs.len() {
        return Err(mismatch(
            journal_dir,
            reference.describe(),
            format!("{} configured ledger dirs", ledger_dirs.len()),
        ));
    }
    Ok(reference)
}

fn mismatch(dir: &Path, expected: String, found: String) -> StorageError {
    StorageError::CookieMismatch {
        path: dir.display().to_string(),
        expected,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(temp: &TempDir, ledgers: usize) -> (PathBuf, Vec<PathBuf>) {
        let journal = temp.path().join("journal");
        let dirs = (0..ledgers)
            .map(|i| temp.path().join(format!("ledgers{}", i)))
            .collect();
        (journal, dirs)
    }

    #[test]
    fn test_first_start_stamps_every_dir() {
        let temp = TempDir::new().unwrap();
        let (journal, dirs) = layout(&temp, 2);

        let cookie = verify_or_stamp(&journal, &dirs).unwrap();
        assert!(journal.join(COOKIE_FILE).exists());
        assert!(dirs.iter().all(|d| d.join(COOKIE_FILE).exists()));

        let again = verify_or_stamp(&journal, &dirs).unwrap();
        assert_eq!(cookie, again);
    }

    #[test]
    fn test_missing_cookie_is_refused() {
        let temp = TempDir::new().unwrap();
        let (journal, dirs) = layout(&temp, 2);
        verify_or_stamp(&journal, &dirs).unwrap();

        fs::remove_file(dirs[1].join(COOKIE_FILE)).unwrap();
        let err = verify_or_stamp(&journal, &dirs).unwrap_err();
        assert!(matches!(err, StorageError::CookieMismatch { .. }));
    }

    #[test]
    fn test_foreign_cookie_is_refused() {
        let temp = TempDir::new().unwrap();
        let (journal, dirs) = layout(&temp, 1);
        verify_or_stamp(&journal, &dirs).unwrap();

        let other = TempDir::new().unwrap();
        let (other_journal, other_dirs) = layout(&other, 1);
        verify_or_stamp(&other_journal, &other_dirs).unwrap();
        fs::copy(
            other_dirs[0].join(COOKIE_FILE),
            dirs[0].join(COOKIE_FILE),
        )
        .unwrap();

        assert!(verify_or_stamp(&journal, &dirs).is_err());
    }

    #[test]
    fn test_changed_dir_count_is_refused() {
        let temp = TempDir::new().unwrap();
        let (journal, dirs) = layout(&temp, 2);
        verify_or_stamp(&journal, &dirs).unwrap();
        assert!(verify_or_stamp(&journal, &dirs[..1]).is_err());
    }
}
