//! Per-record transactions.
//!
//! A [`Transaction`] holds the write lock of one record for its whole
//! lifetime, so a read-modify-write on that record cannot interleave with
//! another writer. Writes are staged in memory and reach the log only on
//! [`Transaction::commit`]; dropping an uncommitted transaction discards them.

use crate::cancel::CancelToken;
use crate::error::{Result, StoreError};
use crate::log::{EntryKind, LogEntry};
use crate::store::SnapshotStore;
use crate::types::{FieldMap, RecordId, Timestamp, Version, VersionInfo};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

type RecordGuard = ArcMutexGuard<RawMutex, ()>;

/// One write lock per record identifier.
///
/// Writers on different records never share a lock. An entry lives only while
/// some transaction holds or waits on it.
#[derive(Default)]
pub(crate) struct RecordLocks {
    locks: Mutex<HashMap<RecordId, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `id` is held, or the token's deadline passes.
    fn acquire(&self, id: RecordId, cancel: &CancelToken) -> Result<RecordGuard> {
        let lock = Arc::clone(self.locks.lock().entry(id).or_default());

        let deadline = match cancel.deadline() {
            Some(deadline) => deadline,
            None => return Ok(lock.lock_arc()),
        };
        match lock.try_lock_arc_until(deadline) {
            Some(guard) => Ok(guard),
            None => {
                drop(lock);
                self.release(id);
                Err(StoreError::DeadlineExceeded)
            }
        }
    }

    /// Drop the entry for `id` once nobody holds or waits on it.
    ///
    /// Waiters clone the lock under the map mutex, so a count of one seen
    /// under that mutex means the map holds the only reference.
    fn release(&self, id: RecordId) {
        let mut locks = self.locks.lock();
        if locks.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }

    #[cfg(test)]
    fn strong_count(&self, id: RecordId) -> usize {
        self.locks.lock().get(&id).map_or(0, Arc::strong_count)
    }
}

/// A unit of work on a single record.
pub struct Transaction<'s> {
    store: &'s SnapshotStore,
    id: RecordId,
    cancel: CancelToken,
    staged: Option<LogEntry>,
    guard: Option<RecordGuard>,
}

impl<'s> Transaction<'s> {
    pub(crate) fn begin(
        store: &'s SnapshotStore,
        id: RecordId,
        cancel: &CancelToken,
    ) -> Result<Self> {
        cancel.check()?;
        let guard = store.record_locks().acquire(id, cancel)?;
        let txn = Self {
            store,
            id,
            cancel: cancel.clone(),
            staged: None,
            guard: Some(guard),
        };

        // The wait for the lock may have outlived the caller.
        cancel.check()?;
        Ok(txn)
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Whether the record has a current-state row.
    pub fn exists(&self) -> bool {
        self.store.contains(self.id)
    }

    /// Current field mapping as committed before this transaction.
    pub fn read_current(&self) -> Result<FieldMap> {
        self.store.read_current(self.id)
    }

    /// Version number the next append would receive.
    pub fn next_version(&self) -> Result<Version> {
        self.store
            .latest_version(self.id)
            .map(Version::next)
            .ok_or(StoreError::NotFound(self.id))
    }

    /// Stage creation of the record with `fields` as version 1.
    pub fn insert_initial(&mut self, fields: FieldMap) -> Result<()> {
        self.ensure_nothing_staged()?;
        if self.exists() {
            return Err(StoreError::AlreadyExists(self.id));
        }

        self.staged = Some(LogEntry {
            kind: EntryKind::Insert,
            record_id: self.id,
            version: Version::FIRST,
            created_at: Timestamp::now(),
            fields,
        });
        Ok(())
    }

    /// Stage a new version holding `fields`, returning its number.
    pub fn append_version(&mut self, fields: FieldMap) -> Result<Version> {
        self.ensure_nothing_staged()?;
        let version = self.next_version()?;

        self.staged = Some(LogEntry {
            kind: EntryKind::Append,
            record_id: self.id,
            version,
            created_at: Timestamp::now(),
            fields,
        });
        Ok(version)
    }

    /// Commit the staged write.
    ///
    /// Returns the committed version, or `None` when nothing was staged. A
    /// fired cancel token rolls the transaction back instead.
    pub fn commit(mut self) -> Result<Option<VersionInfo>> {
        let entry = match self.staged.take() {
            Some(entry) => entry,
            None => return Ok(None),
        };

        if let Err(e) = self.cancel.check() {
            warn!(record = %self.id, error = %e, "transaction cancelled before commit");
            return Err(e);
        }

        self.store.commit_entry(&entry)?;
        Ok(Some(VersionInfo {
            version: entry.version,
            created_at: entry.created_at,
        }))
    }

    /// Discard the staged write.
    pub fn rollback(self) {}

    fn ensure_nothing_staged(&self) -> Result<()> {
        match &self.staged {
            Some(entry) => Err(StoreError::Conflict {
                id: self.id,
                version: entry.version,
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(entry) = &self.staged {
            debug!(record = %self.id, version = %entry.version, "transaction rolled back");
        }
        drop(self.guard.take());
        self.store.record_locks().release(self.id);
    }
}
