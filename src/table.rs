//! Current-state table and per-record version index.
//!
//! The table holds one row per record with its current field mapping, plus
//! the location of every committed version in the log. It is rebuilt from
//! the log on open and periodically checkpointed to disk so recovery only has
//! to replay the log tail.

use crate::error::{Result, StoreError};
use crate::log::{EntryKind, LogEntry};
use crate::types::{RecordId, RecordRow, Timestamp, Version, VersionInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for table checkpoints.
const TABLE_MAGIC: &[u8; 4] = b"TTT\0";

/// Current checkpoint format version.
const TABLE_VERSION: u8 = 1;

/// Location of one committed version in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSlot {
    pub version: Version,
    pub created_at: Timestamp,
    pub offset: u64,
}

/// A record's current row and its version index, ordered oldest first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableRow {
    pub row: RecordRow,
    pub versions: Vec<VersionSlot>,
}

/// On-disk form of the table.
#[derive(Serialize, Deserialize)]
struct TableSnapshot {
    log_offset: u64,
    rows: Vec<TableRow>,
}

/// In-memory current-state table.
pub struct RecordTable {
    /// Path to the checkpoint file.
    path: PathBuf,

    rows: HashMap<RecordId, TableRow>,

    /// Log offset up to which every frame has been applied.
    applied_offset: u64,

    /// Total number of version slots.
    version_count: u64,
}

impl RecordTable {
    /// Create an empty table.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            rows: HashMap::new(),
            applied_offset: 0,
            version_count: 0,
        }
    }

    /// Load the table from its checkpoint, or an empty table if there is none.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut table = Self::new(path);
        if table.path.exists() {
            table.load_from_file()?;
        }
        Ok(table)
    }

    /// Current row for `id`.
    pub fn row(&self, id: RecordId) -> Option<&RecordRow> {
        self.rows.get(&id).map(|r| &r.row)
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.rows.contains_key(&id)
    }

    /// Log location of a specific version.
    pub fn version_slot(&self, id: RecordId, version: Version) -> Option<VersionSlot> {
        let entry = self.rows.get(&id)?;
        // Versions are contiguous from 1, so the slot index is version - 1.
        let slot = entry.versions.get(version.0.checked_sub(1)? as usize)?;
        debug_assert_eq!(slot.version, version);
        Some(*slot)
    }

    /// Version metadata for `id`, most recent first.
    pub fn version_meta(&self, id: RecordId) -> Option<Vec<VersionInfo>> {
        let entry = self.rows.get(&id)?;
        Some(
            entry
                .versions
                .iter()
                .rev()
                .map(|slot| VersionInfo {
                    version: slot.version,
                    created_at: slot.created_at,
                })
                .collect(),
        )
    }

    /// Latest committed version of `id`.
    pub fn latest_version(&self, id: RecordId) -> Option<Version> {
        self.rows.get(&id).map(|r| r.row.latest)
    }

    /// Check that `entry` may be applied on top of the current table.
    pub fn check(&self, entry: &LogEntry) -> Result<()> {
        match entry.kind {
            EntryKind::Insert => {
                if self.rows.contains_key(&entry.record_id) {
                    return Err(StoreError::AlreadyExists(entry.record_id));
                }
                if entry.version != Version::FIRST {
                    return Err(StoreError::Conflict {
                        id: entry.record_id,
                        version: entry.version,
                    });
                }
            }
            EntryKind::Append => {
                let latest = self
                    .latest_version(entry.record_id)
                    .ok_or(StoreError::NotFound(entry.record_id))?;
                if entry.version != latest.next() {
                    return Err(StoreError::Conflict {
                        id: entry.record_id,
                        version: entry.version,
                    });
                }
            }
        }
        Ok(())
    }

    /// Apply a committed entry whose frame spans `offset..end_offset`.
    pub fn apply(&mut self, entry: &LogEntry, offset: u64, end_offset: u64) -> Result<()> {
        self.check(entry)?;

        let slot = VersionSlot {
            version: entry.version,
            created_at: entry.created_at,
            offset,
        };

        match entry.kind {
            EntryKind::Insert => {
                self.rows.insert(
                    entry.record_id,
                    TableRow {
                        row: RecordRow {
                            id: entry.record_id,
                            data: entry.fields.clone(),
                            latest: entry.version,
                            created_at: entry.created_at,
                            updated_at: entry.created_at,
                        },
                        versions: vec![slot],
                    },
                );
            }
            EntryKind::Append => {
                let table_row = self
                    .rows
                    .get_mut(&entry.record_id)
                    .ok_or(StoreError::NotFound(entry.record_id))?;
                table_row.row.data = entry.fields.clone();
                table_row.row.latest = entry.version;
                table_row.row.updated_at = entry.created_at;
                table_row.versions.push(slot);
            }
        }

        self.version_count += 1;
        self.applied_offset = self.applied_offset.max(end_offset);
        Ok(())
    }

    pub fn applied_offset(&self) -> u64 {
        self.applied_offset
    }

    pub fn record_count(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn version_count(&self) -> u64 {
        self.version_count
    }

    /// Write a checkpoint. The file is replaced atomically via rename.
    pub fn save(&self) -> Result<()> {
        let mut rows: Vec<TableRow> = self.rows.values().cloned().collect();
        rows.sort_by_key(|r| r.row.id);

        let snapshot = TableSnapshot {
            log_offset: self.applied_offset,
            rows,
        };
        let encoded = rmp_serde::to_vec(&snapshot)?;

        let tmp_path = self.path.with_extension("tbl.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(TABLE_MAGIC)?;
            file.write_all(&[TABLE_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }

    fn load_from_file(&mut self) -> Result<()> {
        let mut file = File::open(&self.path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != TABLE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid table magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != TABLE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported table version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        if len > file.metadata()?.len() {
            return Err(StoreError::Corruption("table checkpoint truncated".into()));
        }

        let mut encoded = vec![0u8; len as usize];
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

        let snapshot: TableSnapshot = rmp_serde::from_slice(&encoded)?;

        self.applied_offset = snapshot.log_offset;
        self.version_count = snapshot
            .rows
            .iter()
            .map(|r| r.versions.len() as u64)
            .sum();
        self.rows = snapshot
            .rows
            .into_iter()
            .map(|r| (r.row.id, r))
            .collect();

        Ok(())
    }
}
