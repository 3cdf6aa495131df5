//! Append-only version log.
//!
//! Every committed transaction is one frame in the log, carrying the record's
//! full field mapping for the new version. The frame write is the commit
//! point: the current-state table is a materialized view that can always be
//! rebuilt by replaying the log.
//!
//! Layout: a 5-byte header (magic + format version) followed by frames of
//! `len: u32le | rmp-serde(LogEntry) | crc32: u32le`.

use crate::error::{Result, StoreError};
use crate::types::{FieldMap, RecordId, Timestamp, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the version log.
const LOG_MAGIC: &[u8; 4] = b"TTV\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Size of the file header.
pub const LOG_HEADER_SIZE: u64 = 5;

/// Frame overhead: length prefix + checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Upper bound on one encoded entry.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// What a committed transaction did to its record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Created the record together with version 1.
    Insert,
    /// Overwrote the current row and appended a version.
    Append,
}

/// A single committed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: EntryKind,
    pub record_id: RecordId,
    pub version: Version,
    pub created_at: Timestamp,
    pub fields: FieldMap,
}

/// Result of scanning the log during recovery.
#[derive(Debug, Default)]
pub struct Replay {
    /// Entries with the offset each frame starts at.
    pub entries: Vec<(u64, LogEntry)>,
    /// Bytes dropped from an incomplete tail frame.
    pub truncated_bytes: u64,
}

struct LogFile {
    file: File,
    size: u64,
    writes_since_sync: u64,
}

/// Append-only log of record versions.
pub struct VersionLog {
    path: PathBuf,
    inner: Mutex<LogFile>,
    /// Sync every N appends (1 = every append).
    sync_interval: u64,
}

impl VersionLog {
    /// Open or create a log that syncs on every append.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, 1)
    }

    /// Open or create a log with a custom sync interval.
    /// - sync_interval = 0 or 1: sync every append (safest)
    /// - sync_interval = N: sync every N appends
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut size = file.metadata()?.len();
        if size == 0 {
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
            size = LOG_HEADER_SIZE;
        } else {
            Self::verify_header(&mut file)?;
        }

        Ok(Self {
            path,
            inner: Mutex::new(LogFile {
                file,
                size,
                writes_since_sync: 0,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append an entry, returning the offsets where its frame starts and ends.
    ///
    /// On any write failure the file is cut back to its previous length so a
    /// failed append leaves no partial frame behind.
    pub fn append(&self, entry: &LogEntry) -> Result<(u64, u64)> {
        let frame = Self::encode_frame(entry)?;

        let mut inner = self.inner.lock();
        let offset = inner.size;

        let written = inner
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| inner.file.write_all(&frame));
        if let Err(e) = written {
            let _ = inner.file.set_len(offset);
            return Err(e.into());
        }

        inner.writes_since_sync += 1;
        if inner.writes_since_sync >= self.sync_interval {
            if let Err(e) = inner.file.sync_data() {
                let _ = inner.file.set_len(offset);
                return Err(e.into());
            }
            inner.writes_since_sync = 0;
        }

        let end = offset + frame.len() as u64;
        inner.size = end;
        debug!(
            record = %entry.record_id,
            version = %entry.version,
            offset,
            "appended version frame"
        );
        Ok((offset, end))
    }

    /// Read the entry whose frame starts at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<LogEntry> {
        let mut inner = self.inner.lock();
        if offset < LOG_HEADER_SIZE || offset >= inner.size {
            return Err(StoreError::Corruption(format!(
                "log offset {} out of range",
                offset
            )));
        }
        inner.file.seek(SeekFrom::Start(offset))?;
        let (entry, _) = Self::read_frame(&mut inner.file)?;
        Ok(entry)
    }

    /// Scan all frames from `offset` to the end of the log.
    ///
    /// An incomplete or checksum-failing frame at the tail is an interrupted
    /// commit and is truncated away. A bad frame followed by any intact frame
    /// is reported as corruption and nothing is truncated.
    pub fn replay_from(&self, offset: u64) -> Result<Replay> {
        let mut inner = self.inner.lock();
        let end = inner.size;
        let mut offset = offset.max(LOG_HEADER_SIZE);
        let mut replay = Replay::default();

        inner.file.seek(SeekFrom::Start(offset))?;
        while offset < end {
            match Self::read_frame(&mut inner.file) {
                Ok((entry, frame_len)) => {
                    replay.entries.push((offset, entry));
                    offset += frame_len;
                }
                Err(e) => {
                    // An interrupted append leaves garbage only after the last
                    // good frame. A well-formed frame past this one means the
                    // damage is in committed history.
                    if Self::later_frame_exists(&mut inner.file, offset, end)? {
                        return Err(StoreError::Corruption(format!(
                            "unreadable log frame at offset {}: {}",
                            offset, e
                        )));
                    }

                    warn!(
                        path = %self.path.display(),
                        offset,
                        error = %e,
                        "truncating incomplete tail of version log"
                    );
                    inner.file.set_len(offset)?;
                    inner.file.sync_all()?;
                    replay.truncated_bytes = end - offset;
                    inner.size = offset;
                    break;
                }
            }
        }

        Ok(replay)
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Current file size (also the offset the next frame will land at).
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn verify_header(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid version log magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported version log format: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(entry)?;
        if encoded.len() > MAX_ENTRY_SIZE {
            return Err(StoreError::Serialization(format!(
                "log entry of {} bytes exceeds limit",
                encoded.len()
            )));
        }

        let mut frame = Vec::with_capacity(encoded.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    /// Read one frame at the current position, returning the entry and the
    /// frame's total length.
    fn read_frame(file: &mut File) -> Result<(LogEntry, u64)> {
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(StoreError::Corruption("log entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok((entry, len as u64 + FRAME_OVERHEAD))
    }

    /// Whether a well-formed frame starts anywhere in `offset + 1..end`.
    fn later_frame_exists(file: &mut File, offset: u64, end: u64) -> Result<bool> {
        let mut rest = vec![0u8; (end - offset) as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut rest)?;

        Ok((1..rest.len()).any(|start| Self::decode_frame(&rest[start..]).is_some()))
    }

    /// Decode a frame at the start of `bytes`, if one is there intact.
    fn decode_frame(bytes: &[u8]) -> Option<LogEntry> {
        let len_bytes: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 || len > MAX_ENTRY_SIZE {
            return None;
        }

        let encoded = bytes.get(4..4 + len)?;
        let checksum: [u8; 4] = bytes.get(4 + len..8 + len)?.try_into().ok()?;
        if u32::from_le_bytes(checksum) != crc32fast::hash(encoded) {
            return None;
        }
        rmp_serde::from_slice(encoded).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: i64, version: u64, name: &str) -> LogEntry {
        LogEntry {
            kind: if version == 1 {
                EntryKind::Insert
            } else {
                EntryKind::Append
            },
            record_id: RecordId(id),
            version: Version(version),
            created_at: Timestamp::now(),
            fields: [("name".to_string(), name.to_string())].into_iter().collect(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = VersionLog::open(dir.path().join("versions.log")).unwrap();

        let first = entry(1, 1, "alice");
        let (offset, end) = log.append(&first).unwrap();
        assert_eq!(offset, LOG_HEADER_SIZE);
        assert_eq!(end, log.size());

        let read = log.read_at(offset).unwrap();
        assert_eq!(read, first);
    }

    #[test]
    fn test_replay_returns_offsets_in_order() {
        let dir = TempDir::new().unwrap();
        let log = VersionLog::open(dir.path().join("versions.log")).unwrap();

        let mut offsets = Vec::new();
        for v in 1..=5 {
            offsets.push(log.append(&entry(1, v, &format!("n{}", v))).unwrap().0);
        }

        let replay = log.replay_from(0).unwrap();
        assert_eq!(replay.truncated_bytes, 0);
        let replayed: Vec<u64> = replay.entries.iter().map(|(o, _)| *o).collect();
        assert_eq!(replayed, offsets);
        assert_eq!(replay.entries[4].1.version, Version(5));

        let tail = log.replay_from(offsets[3]).unwrap();
        assert_eq!(tail.entries.len(), 2);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.log");

        {
            let log = VersionLog::open(&path).unwrap();
            log.append(&entry(7, 1, "a")).unwrap();
            log.append(&entry(7, 2, "b")).unwrap();
        }

        let log = VersionLog::open(&path).unwrap();
        let replay = log.replay_from(0).unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.entries[1].1.fields["name"], "b");
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.log");

        let good_size = {
            let log = VersionLog::open(&path).unwrap();
            log.append(&entry(1, 1, "alice")).unwrap();
            log.size()
        };

        // Simulate a crash halfway through the next frame.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[40, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let log = VersionLog::open(&path).unwrap();
        let replay = log.replay_from(0).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.truncated_bytes, 7);
        assert_eq!(log.size(), good_size);

        // The log keeps working after truncation.
        let (offset, _) = log.append(&entry(1, 2, "alicia")).unwrap();
        assert_eq!(offset, good_size);
    }

    #[test]
    fn test_corrupt_middle_frame_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.log");

        {
            let log = VersionLog::open(&path).unwrap();
            log.append(&entry(1, 1, "alice")).unwrap();
            log.append(&entry(1, 2, "alicia")).unwrap();
        }

        // Flip a payload byte inside the first frame.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(LOG_HEADER_SIZE + 6)).unwrap();
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte).unwrap();
            file.seek(SeekFrom::Start(LOG_HEADER_SIZE + 6)).unwrap();
            file.write_all(&[byte[0] ^ 0xFF]).unwrap();
        }

        let log = VersionLog::open(&path).unwrap();
        assert!(matches!(log.replay_from(0), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn test_damaged_length_prefix_mid_log_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.log");

        let (second, size) = {
            let log = VersionLog::open(&path).unwrap();
            let mut offsets = Vec::new();
            for id in 1..=5 {
                offsets.push(log.append(&entry(id, 1, "x")).unwrap().0);
            }
            (offsets[1], log.size())
        };

        // High byte of the second frame's length: it now claims to run far
        // past the end of the file.
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(second + 3)).unwrap();
            file.write_all(&[0x7F]).unwrap();
        }

        let log = VersionLog::open(&path).unwrap();
        assert!(matches!(log.replay_from(0), Err(StoreError::Corruption(_))));
        assert_eq!(log.size(), size);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.log");
        std::fs::write(&path, b"NOPE!").unwrap();

        assert!(matches!(
            VersionLog::open(&path),
            Err(StoreError::InvalidFormat(_))
        ));
    }
}
