//! Write-ahead journal.
//!
//! Every accepted mutation is appended here and forced to disk before the
//! caller is acknowledged. Journal files are named `{id:016x}.txn` and start
//! with an 8-byte header (`BKJN` + version). Records are framed as
//! `len u32 | crc32 u32 | JournalRecord (protobuf)`.
//!
//! A fresh file is started on every open, so a torn tail left by a crash is
//! never appended to. Replay stops reading a file at its first damaged frame
//! and moves on to the next file.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use prost::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::checkpoint::CompletedCheckpoint;
use super::error::{Result, StorageError};
use super::files::{list_numbered, numbered_file, read_up_to, sync_dir};
use crate::proto::JournalRecord;

const JOURNAL_MAGIC: &[u8; 4] = b"BKJN";
const JOURNAL_VERSION: u32 = 1;
const JOURNAL_EXTENSION: &str = "txn";
pub const JOURNAL_HEADER_LEN: u64 = 8;
const FRAME_HEADER_LEN: usize = 8;
/// Frames claiming more than this are treated as garbage.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Position in the journal. Orders records across files.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogMark {
    pub file_id: u64,
    pub offset: u64,
}

impl std::fmt::Display for LogMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}@{}", self.file_id, self.offset)
    }
}

pub struct Journal {
    dir: PathBuf,
    max_file_size: u64,
    writer: Mutex<JournalWriter>,
}

struct JournalWriter {
    file_id: u64,
    file: File,
    offset: u64,
    next_seq: u64,
    failed: bool,
}

impl Journal {
    /// Open the journal directory and start a new journal file.
    pub fn open(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let ids = list_numbered(&dir, JOURNAL_EXTENSION)?;
        let last_seq = last_sequence(&dir, &ids)?;
        let file_id = ids.last().map_or(1, |id| id + 1);
        let file = create_journal_file(&dir, file_id)?;

        info!(
            dir = %dir.display(),
            file_id,
            existing_files = ids.len(),
            last_seq,
            "Journal opened"
        );

        Ok(Self {
            dir,
            max_file_size,
            writer: Mutex::new(JournalWriter {
                file_id,
                file,
                offset: JOURNAL_HEADER_LEN,
                next_seq: last_seq + 1,
                failed: false,
            }),
        })
    }

    /// Append one record and force it to disk.
    ///
    /// Returns the position of the record. After a write or sync failure the
    /// journal refuses all further appends: whatever reached the file after
    /// the failure point can no longer be trusted.
    pub fn append(&self, mut record: JournalRecord) -> Result<LogMark> {
        let mut writer = self.writer.lock();
        if writer.failed {
            return Err(StorageError::Io(io::Error::other(
                "journal is unwritable after an earlier failure",
            )));
        }
        if writer.offset >= self.max_file_size {
            self.roll(&mut writer)?;
        }

        record.seq = writer.next_seq;
        let body = record.encode_to_vec();
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
        frame.extend_from_slice(&body);

        let position = LogMark {
            file_id: writer.file_id,
            offset: writer.offset,
        };
        if let Err(err) = write_durably(&mut writer.file, &frame) {
            writer.failed = true;
            error!(
                file_id = writer.file_id,
                offset = writer.offset,
                error = %err,
                "Journal write failed"
            );
            return Err(err.into());
        }
        writer.offset += frame.len() as u64;
        writer.next_seq += 1;

        debug!(
            seq = record.seq,
            ledger_id = record.ledger_id,
            entry_id = record.entry_id,
            %position,
            "Journal record appended"
        );
        Ok(position)
    }

    /// Position the next record will be written at.
    pub fn mark(&self) -> LogMark {
        let writer = self.writer.lock();
        LogMark {
            file_id: writer.file_id,
            offset: writer.offset,
        }
    }

    /// Records at or after `from`, in append order.
    ///
    /// The returned iterator reads lazily; calling `replay` again starts over.
    pub fn replay(&self, from: LogMark) -> Result<JournalReplay> {
        let pending = list_numbered(&self.dir, JOURNAL_EXTENSION)?
            .into_iter()
            .filter(|id| *id >= from.file_id)
            .collect();
        Ok(JournalReplay {
            dir: self.dir.clone(),
            pending,
            from,
            current: None,
        })
    }

    /// Delete journal files that lie entirely before the checkpoint's mark.
    ///
    /// Takes a [`CompletedCheckpoint`] so truncation cannot run ahead of the
    /// flushes that make it safe. The active file is never removed.
    pub fn truncate_before(&self, checkpoint: &CompletedCheckpoint) -> Result<usize> {
        let active = self.writer.lock().file_id;
        let boundary = checkpoint.mark().file_id.min(active);

        let mut removed = 0;
        for id in list_numbered(&self.dir, JOURNAL_EXTENSION)? {
            if id >= boundary {
                break;
            }
            match fs::remove_file(numbered_file(&self.dir, id, JOURNAL_EXTENSION)) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if removed > 0 {
            sync_dir(&self.dir)?;
            info!(removed, boundary, "Journal files truncated");
        }
        Ok(removed)
    }

    fn roll(&self, writer: &mut JournalWriter) -> Result<()> {
        let next_id = writer.file_id + 1;
        match create_journal_file(&self.dir, next_id) {
            Ok(file) => {
                debug!(from = writer.file_id, to = next_id, "Journal rolled over");
                writer.file = file;
                writer.file_id = next_id;
                writer.offset = JOURNAL_HEADER_LEN;
                Ok(())
            }
            Err(err) => {
                writer.failed = true;
                error!(file_id = next_id, error = %err, "Journal rollover failed");
                Err(err)
            }
        }
    }
}

fn write_durably(file: &mut File, frame: &[u8]) -> io::Result<()> {
    file.write_all(frame)?;
    file.sync_data()
}

fn create_journal_file(dir: &Path, file_id: u64) -> Result<File> {
    let path = numbered_file(dir, file_id, JOURNAL_EXTENSION);
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)?;
    file.write_all(JOURNAL_MAGIC)?;
    file.write_all(&JOURNAL_VERSION.to_be_bytes())?;
    file.sync_all()?;
    sync_dir(dir)?;
    Ok(file)
}

/// Highest sequence number found in the newest non-empty journal file.
fn last_sequence(dir: &Path, ids: &[u64]) -> Result<u64> {
    for &id in ids.iter().rev() {
        let mut replay = JournalReplay {
            dir: dir.to_path_buf(),
            pending: VecDeque::from([id]),
            from: LogMark::default(),
            current: None,
        };
        let mut last = None;
        for item in replay.by_ref() {
            let (_, record) = item?;
            last = Some(record.seq);
        }
        if let Some(seq) = last {
            return Ok(seq);
        }
    }
    Ok(0)
}

/// Lazy reader over journal records, see [`Journal::replay`].
pub struct JournalReplay {
    dir: PathBuf,
    pending: VecDeque<u64>,
    from: LogMark,
    current: Option<FileCursor>,
}

struct FileCursor {
    file_id: u64,
    reader: BufReader<File>,
    offset: u64,
}

impl JournalReplay {
    fn open_cursor(&self, file_id: u64) -> Result<Option<FileCursor>> {
        let path = numbered_file(&self.dir, file_id, JOURNAL_EXTENSION);
        let mut file = File::open(&path)?;

        let mut header = [0u8; JOURNAL_HEADER_LEN as usize];
        if read_up_to(&mut file, &mut header)? < header.len() {
            warn!(file_id, "Journal file has a torn header, skipping");
            return Ok(None);
        }
        if &header[..4] != JOURNAL_MAGIC {
            return Err(StorageError::corrupt(
                path.display().to_string(),
                "bad journal magic",
            ));
        }

        let mut offset = JOURNAL_HEADER_LEN;
        if file_id == self.from.file_id && self.from.offset > offset {
            offset = file.seek(SeekFrom::Start(self.from.offset))?;
        }
        Ok(Some(FileCursor {
            file_id,
            reader: BufReader::new(file),
            offset,
        }))
    }
}

impl FileCursor {
    fn read_frame(&mut self) -> Result<Option<(LogMark, JournalRecord)>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let read = read_up_to(&mut self.reader, &mut header)?;
        if read == 0 {
            return Ok(None);
        }
        if read < FRAME_HEADER_LEN {
            self.torn("truncated frame header");
            return Ok(None);
        }

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_FRAME_LEN {
            self.torn("frame length out of range");
            return Ok(None);
        }

        let mut body = vec![0u8; len as usize];
        if read_up_to(&mut self.reader, &mut body)? < body.len() {
            self.torn("truncated frame body");
            return Ok(None);
        }
        if crc32fast::hash(&body) != crc {
            self.torn("checksum mismatch");
            return Ok(None);
        }
        let record = match JournalRecord::decode(&body[..]) {
            Ok(record) => record,
            Err(err) => {
                self.torn(&format!("undecodable record: {}", err));
                return Ok(None);
            }
        };

        let position = LogMark {
            file_id: self.file_id,
            offset: self.offset,
        };
        self.offset += (FRAME_HEADER_LEN + body.len()) as u64;
        Ok(Some((position, record)))
    }

    fn torn(&self, reason: &str) {
        warn!(
            file_id = self.file_id,
            offset = self.offset,
            reason,
            "Journal replay stopped at damaged tail"
        );
    }
}

impl Iterator for JournalReplay {
    type Item = Result<(LogMark, JournalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let file_id = self.pending.pop_front()?;
                match self.open_cursor(file_id) {
                    Ok(cursor) => self.current = cursor,
                    Err(err) => return Some(Err(err)),
                }
                continue;
            }

            let cursor = self.current.as_mut()?;
            match cursor.read_frame() {
                Ok(Some(item)) => return Some(Ok(item)),
                Ok(None) => self.current = None,
                Err(err) => {
                    self.current = None;
                    return Some(Err(err));
                }
            }
        }
    }
}
