//! Entry log: append-only segment files holding stored entries.
//!
//! Segment files are named `{id:016x}.log` and spread across the ledger
//! directories by `id % dirs`. Each starts with a 16-byte header
//! (`BKLG` + version u32 + segment id u64) followed by
//! `len u32 | crc32 u32 | stored entry` frames.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{Result, StorageError};
use super::files::{list_numbered, numbered_file, read_up_to, sync_dir};
use super::types::{EntryHeader, EntryLocation};

const SEGMENT_MAGIC: &[u8; 4] = b"BKLG";
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_EXTENSION: &str = "log";
pub const SEGMENT_HEADER_LEN: u64 = 16;
pub const FRAME_HEADER_LEN: u64 = 8;

/// On-disk footprint of a stored entry of `length` bytes.
pub fn frame_len(length: u32) -> u64 {
    FRAME_HEADER_LEN + length as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub id: u64,
    /// Bytes of entry frames, excluding the segment header.
    pub data_len: u64,
}

pub struct EntryLog {
    dirs: Vec<PathBuf>,
    size_limit: u64,
    active: Mutex<ActiveSegment>,
}

struct ActiveSegment {
    id: u64,
    writer: BufWriter<File>,
    offset: u64,
}

impl EntryLog {
    /// Open the entry log over `dirs` and start a new active segment.
    pub fn open(dirs: Vec<PathBuf>, size_limit: u64) -> Result<Self> {
        if dirs.is_empty() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "entry log needs at least one directory",
            )));
        }
        for dir in &dirs {
            fs::create_dir_all(dir)?;
        }

        let existing = list_segments(&dirs)?;
        let id = existing.last().map_or(1, |id| id + 1);
        let log = Self {
            active: Mutex::new(ActiveSegment::create(&segment_dir(&dirs, id), id)?),
            dirs,
            size_limit,
        };

        info!(
            segments = existing.len(),
            active_segment = id,
            size_limit,
            "Entry log opened"
        );
        Ok(log)
    }

    /// Append one stored entry to the active segment.
    pub fn append(&self, stored: &[u8]) -> Result<EntryLocation> {
        let header = EntryHeader::parse(stored)?;
        let length = u32::try_from(stored.len()).map_err(|_| {
            StorageError::MalformedEntry(format!("entry of {} bytes is too large", stored.len()))
        })?;

        let mut active = self.active.lock();
        if active.offset > SEGMENT_HEADER_LEN
            && active.offset + frame_len(length) > self.size_limit
        {
            self.roll(&mut active)?;
        }

        let location = EntryLocation {
            segment_id: active.id,
            offset: active.offset,
            length,
        };
        active.writer.write_all(&length.to_be_bytes())?;
        active.writer.write_all(&crc32fast::hash(stored).to_be_bytes())?;
        active.writer.write_all(stored)?;
        active.offset += frame_len(length);

        debug!(
            ledger_id = header.ledger_id,
            entry_id = header.entry_id,
            segment_id = location.segment_id,
            offset = location.offset,
            "Entry appended to log"
        );
        Ok(location)
    }

    /// Read the stored entry at `location`, verifying its checksum.
    pub fn read(&self, location: EntryLocation) -> Result<Bytes> {
        {
            let mut active = self.active.lock();
            if active.id == location.segment_id {
                active.writer.flush()?;
            }
        }

        let path = self.segment_path(location.segment_id);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::SegmentNotFound(location.segment_id));
            }
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(location.offset))?;

        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        let mut body = vec![0u8; location.length as usize];
        if read_up_to(&mut file, &mut header)? < header.len()
            || read_up_to(&mut file, &mut body)? < body.len()
        {
            return Err(StorageError::corrupt(
                location_name(location),
                "frame extends past end of segment",
            ));
        }

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if len != location.length {
            return Err(StorageError::corrupt(
                location_name(location),
                format!("frame length {} does not match index length", len),
            ));
        }
        if crc32fast::hash(&body) != crc {
            return Err(StorageError::corrupt(
                location_name(location),
                "checksum mismatch",
            ));
        }
        Ok(Bytes::from(body))
    }

    /// Force buffered appends of the active segment to disk.
    ///
    /// Rolled segments were synced when they were sealed.
    pub fn flush(&self) -> Result<()> {
        let mut active = self.active.lock();
        active.writer.flush()?;
        active.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn active_segment_id(&self) -> u64 {
        self.active.lock().id
    }

    /// All segments on disk, ascending by id.
    pub fn segments(&self) -> Result<Vec<SegmentInfo>> {
        let active = {
            let active = self.active.lock();
            (active.id, active.offset)
        };
        let mut segments = Vec::new();
        for id in list_segments(&self.dirs)? {
            let data_len = if id == active.0 {
                active.1 - SEGMENT_HEADER_LEN
            } else {
                match fs::metadata(self.segment_path(id)) {
                    Ok(meta) => meta.len().saturating_sub(SEGMENT_HEADER_LEN),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                }
            };
            segments.push(SegmentInfo { id, data_len });
        }
        Ok(segments)
    }

    /// Remove a sealed segment. Returns `false` if it was already gone.
    pub fn delete_segment(&self, segment_id: u64) -> Result<bool> {
        if segment_id == self.active_segment_id() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("segment {} is active", segment_id),
            )));
        }
        let path = self.segment_path(segment_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(segment_dir(&self.dirs, segment_id))?;
                info!(segment_id, "Entry log segment deleted");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Iterate the intact frames of a segment in file order.
    pub fn scan(&self, segment_id: u64) -> Result<SegmentScan> {
        if segment_id == self.active_segment_id() {
            self.flush()?;
        }
        let path = self.segment_path(segment_id);
        let mut reader = match File::open(&path) {
            Ok(file) => BufReader::new(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::SegmentNotFound(segment_id));
            }
            Err(err) => return Err(err.into()),
        };

        let mut header = [0u8; SEGMENT_HEADER_LEN as usize];
        if read_up_to(&mut reader, &mut header)? < header.len() || &header[..4] != SEGMENT_MAGIC
        {
            return Err(StorageError::corrupt(
                path.display().to_string(),
                "bad segment header",
            ));
        }
        Ok(SegmentScan {
            segment_id,
            reader,
            offset: SEGMENT_HEADER_LEN,
            done: false,
        })
    }

    fn segment_path(&self, segment_id: u64) -> PathBuf {
        numbered_file(segment_dir(&self.dirs, segment_id), segment_id, SEGMENT_EXTENSION)
    }

    fn roll(&self, active: &mut ActiveSegment) -> Result<()> {
        active.writer.flush()?;
        active.writer.get_ref().sync_all()?;
        let sealed = active.id;
        let next = sealed + 1;
        *active = ActiveSegment::create(&segment_dir(&self.dirs, next), next)?;
        debug!(sealed, active_segment = next, "Entry log rolled over");
        Ok(())
    }
}

impl ActiveSegment {
    fn create(dir: &Path, id: u64) -> Result<Self> {
        let path = numbered_file(dir, id, SEGMENT_EXTENSION);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        file.write_all(SEGMENT_MAGIC)?;
        file.write_all(&SEGMENT_VERSION.to_be_bytes())?;
        file.write_all(&id.to_be_bytes())?;
        file.sync_all()?;
        sync_dir(dir)?;
        Ok(Self {
            id,
            writer: BufWriter::new(file),
            offset: SEGMENT_HEADER_LEN,
        })
    }
}

fn segment_dir(dirs: &[PathBuf], segment_id: u64) -> &Path {
    &dirs[(segment_id % dirs.len() as u64) as usize]
}

fn list_segments(dirs: &[PathBuf]) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for dir in dirs {
        ids.extend(list_numbered(dir, SEGMENT_EXTENSION)?);
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

fn location_name(location: EntryLocation) -> String {
    format!("segment {} offset {}", location.segment_id, location.offset)
}

/// Frames of one segment, see [`EntryLog::scan`].
pub struct SegmentScan {
    segment_id: u64,
    reader: BufReader<File>,
    offset: u64,
    done: bool,
}

impl SegmentScan {
    fn read_frame(&mut self) -> Result<Option<(EntryLocation, Bytes)>> {
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        let read = read_up_to(&mut self.reader, &mut header)?;
        if read == 0 {
            return Ok(None);
        }
        if read < header.len() {
            self.torn("truncated frame header");
            return Ok(None);
        }
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        let mut body = Vec::new();
        let read = (&mut self.reader)
            .take(length as u64)
            .read_to_end(&mut body)?;
        if read < length as usize {
            self.torn("truncated frame body");
            return Ok(None);
        }
        if crc32fast::hash(&body) != crc {
            self.torn("checksum mismatch");
            return Ok(None);
        }

        let location = EntryLocation {
            segment_id: self.segment_id,
            offset: self.offset,
            length,
        };
        self.offset += frame_len(length);
        Ok(Some((location, Bytes::from(body))))
    }

    fn torn(&self, reason: &str) {
        warn!(
            segment_id = self.segment_id,
            offset = self.offset,
            reason,
            "Segment scan stopped at damaged frame"
        );
    }
}

impl Iterator for SegmentScan {
    type Item = Result<(EntryLocation, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
