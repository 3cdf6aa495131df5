//! # timetravel
//!
//! A record store that keeps every version of every record. Updates never
//! overwrite history: each one appends an immutable snapshot, and any past
//! snapshot stays readable by its version number.
//!
//! ## Core Concepts
//!
//! - **Records**: current state of an entity, a map of string fields keyed by
//!   a caller-assigned positive identifier
//! - **Versions**: immutable snapshots numbered 1, 2, 3, ... per record; the
//!   latest always equals the record's current state
//! - **Snapshot store**: the append-only version log plus the current-state
//!   table, kept consistent by per-record transactions
//! - **Merge-updates**: sparse `Set`/`Delete` mutations applied to a record
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use timetravel::{CancelToken, Mutations, RecordInput, SnapshotStore, StoreConfig,
//!     VersionedRecordService};
//!
//! let store = SnapshotStore::open_or_create(StoreConfig {
//!     path: "./my-store".into(),
//!     ..Default::default()
//! })?;
//! let service = VersionedRecordService::new(Arc::new(store));
//! let cx = CancelToken::new();
//!
//! service.create_record(&cx, RecordInput::from_pairs(1, [("name", "alice")]))?;
//! service.update_record(&cx, 1, &Mutations::new().set("name", "alicia"))?;
//!
//! let first = service.get_record_version(&cx, 1, 1)?;
//! assert_eq!(first.data["name"], "alice");
//! ```

pub mod api;
pub mod cancel;
pub mod error;
pub mod log;
pub mod service;
pub mod store;
pub mod table;
pub mod txn;
pub mod types;

// Re-exports
pub use api::ApiResponse;
pub use cancel::CancelToken;
pub use error::{ErrorKind, Result, StoreError};
pub use log::{EntryKind, LogEntry, VersionLog};
pub use service::VersionedRecordService;
pub use store::{SnapshotStore, StoreConfig};
pub use table::RecordTable;
pub use txn::Transaction;
pub use types::*;
