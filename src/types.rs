//! Core types for the versioned record store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Field name to field value. Ordered so serialized forms are stable.
pub type FieldMap = BTreeMap<String, String>;

/// Identifier of a record. Always positive once constructed through [`RecordId::new`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl RecordId {
    /// Validate a caller-supplied identifier.
    pub fn new(raw: i64) -> Result<Self> {
        if raw <= 0 {
            return Err(StoreError::InvalidId(raw));
        }
        Ok(RecordId(raw))
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version number of a record snapshot, starting at 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// The version created together with a record.
    pub const FIRST: Version = Version(1);

    /// Validate a caller-supplied version number.
    pub fn new(raw: i64) -> Result<Self> {
        if raw <= 0 {
            return Err(StoreError::InvalidVersion(raw));
        }
        Ok(Version(raw as u64))
    }

    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// RFC 3339 rendering in UTC, as exposed at the API boundary.
    pub fn to_rfc3339(&self) -> String {
        chrono::DateTime::from_timestamp_micros(self.0)
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A record's current state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub data: FieldMap,
}

/// Input for creating a record (identifier not yet validated).
#[derive(Clone, Debug)]
pub struct RecordInput {
    pub id: i64,
    pub data: FieldMap,
}

impl RecordInput {
    pub fn new(id: i64, data: FieldMap) -> Self {
        Self { id, data }
    }

    /// Build an input from `(name, value)` pairs.
    pub fn from_pairs<K, V>(id: i64, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            id,
            data: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Metadata about one committed version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: Version,
    pub created_at: Timestamp,
}

/// A full historical snapshot of a record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub record_id: RecordId,
    pub version: Version,
    pub data: FieldMap,
    pub created_at: Timestamp,
}

/// Current-state row of a record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRow {
    pub id: RecordId,
    pub data: FieldMap,
    pub latest: Version,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Change to a single field in a merge-update.
///
/// On the wire a `Set` is a string and a `Delete` is an explicit `null`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum Mutation {
    Set(String),
    Delete,
}

impl From<Option<String>> for Mutation {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(v) => Mutation::Set(v),
            None => Mutation::Delete,
        }
    }
}

impl From<Mutation> for Option<String> {
    fn from(m: Mutation) -> Self {
        match m {
            Mutation::Set(v) => Some(v),
            Mutation::Delete => None,
        }
    }
}

/// A sparse set of field mutations. Fields not named are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mutations(pub BTreeMap<String, Mutation>);

impl Mutations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `field` to `value`.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(field.into(), Mutation::Set(value.into()));
        self
    }

    /// Remove `field`.
    pub fn delete(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), Mutation::Delete);
        self
    }

    /// Every field of `data` becomes a `Set`.
    pub fn set_all(data: &FieldMap) -> Self {
        Self(
            data.iter()
                .map(|(k, v)| (k.clone(), Mutation::Set(v.clone())))
                .collect(),
        )
    }

    /// Only the `Set` entries, as a field map.
    pub fn set_values(&self) -> FieldMap {
        self.0
            .iter()
            .filter_map(|(k, m)| match m {
                Mutation::Set(v) => Some((k.clone(), v.clone())),
                Mutation::Delete => None,
            })
            .collect()
    }

    /// Merge these mutations into `data`.
    pub fn apply(&self, data: &mut FieldMap) {
        for (field, mutation) in &self.0 {
            match mutation {
                Mutation::Set(value) => {
                    data.insert(field.clone(), value.clone());
                }
                Mutation::Delete => {
                    data.remove(field);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub record_count: u64,
    pub version_count: u64,
    pub log_size_bytes: u64,
}
