//! The snapshot store: current-state rows plus the append-only version log.

use crate::cancel::CancelToken;
use crate::error::{Result, StoreError};
use crate::log::{LogEntry, VersionLog};
use crate::table::RecordTable;
use crate::txn::{RecordLocks, Transaction};
use crate::types::{FieldMap, RecordId, RecordRow, StoreStats, Version, VersionInfo};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory holding the store's files.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Number of version payloads kept in memory.
    pub version_cache_size: usize,

    /// Sync the log every N commits (0 or 1 = every commit).
    pub sync_interval: u64,

    /// Commits between automatic table checkpoints (0 = only on close).
    pub checkpoint_every: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./timetravel.db"),
            create_if_missing: true,
            version_cache_size: 1024,
            sync_interval: 1,
            checkpoint_every: 1000,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"TTS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const MANIFEST_FILE: &str = "MANIFEST";
const LOG_FILE: &str = "versions.log";
const TABLE_FILE: &str = "records.tbl";

/// Durable storage of each record's current state and full version history.
///
/// Every write goes through a [`Transaction`] on one record: the log frame
/// written at commit carries both the new current row and the new version,
/// and the in-memory table is updated under a single write lock, so readers
/// never see one without the other.
pub struct SnapshotStore {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: VersionLog,

    table: RwLock<RecordTable>,

    record_locks: RecordLocks,

    /// Commits hold this shared; checkpoints take it exclusively so a
    /// checkpoint never covers a frame that is not yet in the table.
    commit_gate: RwLock<()>,

    /// Versions are immutable, so cached payloads never go stale.
    version_cache: Mutex<LruCache<(RecordId, Version), FieldMap>>,

    commits_since_checkpoint: AtomicU64,
}

impl SnapshotStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join(MANIFEST_FILE).exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store. Fails if the directory already holds one.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        if config.path.join(MANIFEST_FILE).exists() || config.path.join(LOG_FILE).exists() {
            return Err(StoreError::StoreExists(config.path.display().to_string()));
        }
        Self::write_manifest(&config.path)?;
        let log = VersionLog::open_with_sync_interval(
            config.path.join(LOG_FILE),
            config.sync_interval,
        )?;
        let table = RecordTable::new(config.path.join(TABLE_FILE));

        info!(path = %config.path.display(), "created snapshot store");
        Ok(Self::assemble(config, lock_file, log, table))
    }

    /// Open an existing store, replaying any log frames newer than the last
    /// table checkpoint.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let log = VersionLog::open_with_sync_interval(
            config.path.join(LOG_FILE),
            config.sync_interval,
        )?;
        let table = Self::recover(&config.path, &log)?;

        info!(
            path = %config.path.display(),
            records = table.record_count(),
            versions = table.version_count(),
            "opened snapshot store"
        );
        Ok(Self::assemble(config, lock_file, log, table))
    }

    fn assemble(config: StoreConfig, lock_file: File, log: VersionLog, table: RecordTable) -> Self {
        let cache_size = NonZeroUsize::new(config.version_cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            config,
            _lock_file: lock_file,
            log,
            table: RwLock::new(table),
            record_locks: RecordLocks::new(),
            commit_gate: RwLock::new(()),
            version_cache: Mutex::new(LruCache::new(cache_size)),
            commits_since_checkpoint: AtomicU64::new(0),
        }
    }

    /// Rebuild the table from the checkpoint and the log tail.
    fn recover(path: &Path, log: &VersionLog) -> Result<RecordTable> {
        let table_path = path.join(TABLE_FILE);

        let mut table = match RecordTable::load(&table_path) {
            Ok(table) if table.applied_offset() <= log.size() => table,
            Ok(table) => {
                warn!(
                    checkpoint_offset = table.applied_offset(),
                    log_size = log.size(),
                    "checkpoint is ahead of the version log; rebuilding from log"
                );
                RecordTable::new(&table_path)
            }
            Err(e) => {
                warn!(error = %e, "discarding unreadable table checkpoint");
                RecordTable::new(&table_path)
            }
        };

        let replay = log.replay_from(table.applied_offset())?;
        let log_end = log.size();
        let replayed = replay.entries.len();

        let mut entries = replay.entries.into_iter().peekable();
        while let Some((offset, entry)) = entries.next() {
            let end = entries.peek().map(|(next, _)| *next).unwrap_or(log_end);
            table.apply(&entry, offset, end).map_err(|e| {
                StoreError::Corruption(format!(
                    "log frame at offset {} cannot be replayed: {}",
                    offset, e
                ))
            })?;
        }

        if replayed > 0 || replay.truncated_bytes > 0 {
            info!(
                replayed,
                truncated_bytes = replay.truncated_bytes,
                "recovered version log tail"
            );
        }

        Ok(table)
    }

    // --- Reads ---

    /// Current field mapping of `id`.
    pub fn read_current(&self, id: RecordId) -> Result<FieldMap> {
        self.table
            .read()
            .row(id)
            .map(|row| row.data.clone())
            .ok_or(StoreError::NotFound(id))
    }

    /// Current row of `id`, including its timestamps and latest version.
    pub fn read_row(&self, id: RecordId) -> Result<RecordRow> {
        self.table
            .read()
            .row(id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Field mapping of one historical version.
    pub fn read_version(&self, id: RecordId, version: Version) -> Result<FieldMap> {
        let slot = {
            let table = self.table.read();
            if !table.contains(id) {
                return Err(StoreError::NotFound(id));
            }
            table
                .version_slot(id, version)
                .ok_or(StoreError::VersionNotFound { id, version })?
        };

        if let Some(fields) = self.version_cache.lock().get(&(id, version)) {
            return Ok(fields.clone());
        }

        let entry = self.log.read_at(slot.offset)?;
        if entry.record_id != id || entry.version != version {
            return Err(StoreError::Corruption(format!(
                "log frame at offset {} holds {}@{}, expected {}@{}",
                slot.offset, entry.record_id, entry.version, id, version
            )));
        }

        self.version_cache
            .lock()
            .put((id, version), entry.fields.clone());
        Ok(entry.fields)
    }

    /// Version metadata of `id`, most recent first.
    pub fn list_version_meta(&self, id: RecordId) -> Result<Vec<VersionInfo>> {
        self.table
            .read()
            .version_meta(id)
            .ok_or(StoreError::NotFound(id))
    }

    pub(crate) fn contains(&self, id: RecordId) -> bool {
        self.table.read().contains(id)
    }

    pub(crate) fn latest_version(&self, id: RecordId) -> Option<Version> {
        self.table.read().latest_version(id)
    }

    // --- Writes ---

    /// Start a transaction on `id`, blocking while another writer holds it.
    pub fn begin(&self, id: RecordId, cancel: &CancelToken) -> Result<Transaction<'_>> {
        Transaction::begin(self, id, cancel)
    }

    /// Create `id` with `fields` as its current row and version 1.
    pub fn insert_initial(
        &self,
        cancel: &CancelToken,
        id: RecordId,
        fields: FieldMap,
    ) -> Result<VersionInfo> {
        let mut txn = self.begin(id, cancel)?;
        txn.insert_initial(fields)?;
        Self::committed(id, txn.commit()?)
    }

    /// Overwrite the current row of `id` and append the next version.
    pub fn append_version(
        &self,
        cancel: &CancelToken,
        id: RecordId,
        fields: FieldMap,
    ) -> Result<VersionInfo> {
        let mut txn = self.begin(id, cancel)?;
        txn.append_version(fields)?;
        Self::committed(id, txn.commit()?)
    }

    fn committed(id: RecordId, info: Option<VersionInfo>) -> Result<VersionInfo> {
        info.ok_or_else(|| StoreError::Corruption(format!("commit on {} staged nothing", id)))
    }

    /// Write `entry` to the log and apply it to the table.
    ///
    /// Callers hold the record lock of `entry.record_id`.
    pub(crate) fn commit_entry(&self, entry: &LogEntry) -> Result<()> {
        {
            let _gate = self.commit_gate.read();

            self.table.read().check(entry)?;
            let (offset, end) = self.log.append(entry)?;
            self.table.write().apply(entry, offset, end).map_err(|e| {
                StoreError::Corruption(format!(
                    "committed frame at offset {} not applied: {}",
                    offset, e
                ))
            })?;

            self.version_cache
                .lock()
                .put((entry.record_id, entry.version), entry.fields.clone());
        }

        debug!(record = %entry.record_id, version = %entry.version, "committed");
        self.maybe_checkpoint();
        Ok(())
    }

    fn maybe_checkpoint(&self) {
        let every = self.config.checkpoint_every;
        if every == 0 {
            return;
        }
        let commits = self.commits_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        if commits >= every {
            // The commit is already durable; a failed checkpoint only means a
            // longer replay on the next open.
            if let Err(e) = self.checkpoint() {
                warn!(error = %e, "automatic checkpoint failed");
            }
        }
    }

    // --- Maintenance ---

    /// Persist the current-state table so the next open replays less log.
    pub fn checkpoint(&self) -> Result<()> {
        let _gate = self.commit_gate.write();
        self.log.sync()?;
        let table = self.table.read();
        table.save()?;
        self.commits_since_checkpoint.store(0, Ordering::SeqCst);
        debug!(log_offset = table.applied_offset(), "checkpointed record table");
        Ok(())
    }

    /// Force pending log writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let table = self.table.read();
        StoreStats {
            record_count: table.record_count(),
            version_count: table.version_count(),
            log_size_bytes: self.log.size(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub(crate) fn record_locks(&self) -> &RecordLocks {
        &self.record_locks
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join(MANIFEST_FILE))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(StoreError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for SnapshotStore {
    fn drop(&mut self) {
        // Best-effort checkpoint on close
        if let Err(e) = self.checkpoint() {
            warn!(error = %e, "checkpoint on close failed");
        }
    }
}
