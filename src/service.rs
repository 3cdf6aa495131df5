//! Versioned record service.
//!
//! Translates create/read/update requests into snapshot store calls and
//! implements merge-update semantics. Identifiers and version numbers arrive
//! unvalidated from the boundary and are checked before any storage access.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::store::SnapshotStore;
use crate::types::{Mutations, Record, RecordId, RecordInput, Version, VersionInfo};
use std::sync::Arc;
use tracing::debug;

/// Create, read and merge-update records while keeping every version.
///
/// Holds no state of its own between calls; everything is read from the
/// store it was constructed with.
#[derive(Clone)]
pub struct VersionedRecordService {
    store: Arc<SnapshotStore>,
}

impl VersionedRecordService {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Latest state of a record.
    pub fn get_record(&self, cx: &CancelToken, id: i64) -> Result<Record> {
        let id = RecordId::new(id)?;
        cx.check()?;

        let data = self.store.read_current(id)?;
        Ok(Record { id, data })
    }

    /// State of a record as of `version`.
    pub fn get_record_version(&self, cx: &CancelToken, id: i64, version: i64) -> Result<Record> {
        let id = RecordId::new(id)?;
        let version = Version::new(version)?;
        cx.check()?;

        let data = self.store.read_version(id, version)?;
        Ok(Record { id, data })
    }

    /// All versions of a record, most recent first.
    pub fn list_versions(&self, cx: &CancelToken, id: i64) -> Result<Vec<VersionInfo>> {
        let id = RecordId::new(id)?;
        cx.check()?;

        self.store.list_version_meta(id)
    }

    /// Create a record; its data becomes version 1.
    pub fn create_record(&self, cx: &CancelToken, input: RecordInput) -> Result<Record> {
        let id = RecordId::new(input.id)?;

        self.store.insert_initial(cx, id, input.data.clone())?;
        debug!(record = %id, "created record");
        Ok(Record {
            id,
            data: input.data,
        })
    }

    /// Merge `mutations` into the current state of a record and commit the
    /// result as a new version. Returns the full resulting state.
    ///
    /// The read, the merge and both writes happen in one store transaction.
    pub fn update_record(&self, cx: &CancelToken, id: i64, mutations: &Mutations) -> Result<Record> {
        let id = RecordId::new(id)?;

        let mut txn = self.store.begin(id, cx)?;
        let mut data = txn.read_current()?;
        mutations.apply(&mut data);
        let version = txn.append_version(data.clone())?;
        txn.commit()?;

        debug!(record = %id, %version, changed = mutations.len(), "updated record");
        Ok(Record { id, data })
    }

    /// Create the record if absent, otherwise set every supplied field on it.
    ///
    /// Fields cannot be removed through this path: each supplied key becomes
    /// a set. Use [`update_record`](Self::update_record) with a delete
    /// mutation to remove a field.
    pub fn create_or_update(&self, cx: &CancelToken, input: RecordInput) -> Result<Record> {
        let id = RecordId::new(input.id)?;

        let mut txn = self.store.begin(id, cx)?;
        let data = if txn.exists() {
            let mut data = txn.read_current()?;
            Mutations::set_all(&input.data).apply(&mut data);
            txn.append_version(data.clone())?;
            data
        } else {
            txn.insert_initial(input.data.clone())?;
            input.data
        };
        txn.commit()?;

        Ok(Record { id, data })
    }

    /// Apply `mutations` to an existing record, or create it from the
    /// mutations' set values when it does not exist yet.
    ///
    /// The existence check and the write happen in one transaction, so a
    /// concurrent post on the same id becomes an update, never a failure.
    pub fn post_record(&self, cx: &CancelToken, id: i64, mutations: &Mutations) -> Result<Record> {
        let id = RecordId::new(id)?;

        let mut txn = self.store.begin(id, cx)?;
        let data = if txn.exists() {
            let mut data = txn.read_current()?;
            mutations.apply(&mut data);
            txn.append_version(data.clone())?;
            data
        } else {
            let data = mutations.set_values();
            txn.insert_initial(data.clone())?;
            data
        };
        txn.commit()?;

        Ok(Record { id, data })
    }
}
