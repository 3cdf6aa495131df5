//! Error types for the versioned record store.

use crate::types::{RecordId, Version};
use thiserror::Error;

/// Main error type for store and service operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid id {0}; id must be a positive number")]
    InvalidId(i64),

    #[error("invalid version {0}; version must be a positive number")]
    InvalidVersion(i64),

    #[error("Record not found: {0}")]
    NotFound(RecordId),

    #[error("Version not found: {id}@{version}")]
    VersionNotFound { id: RecordId, version: Version },

    #[error("Record already exists: {0}")]
    AlreadyExists(RecordId),

    #[error("Version conflict: {id}@{version} already committed")]
    Conflict { id: RecordId, version: Version },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Store already exists at {0}")]
    StoreExists(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
}

/// Coarse classification of a [`StoreError`], as seen by callers at the
/// boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidId,
    InvalidVersion,
    NotFound,
    VersionNotFound,
    AlreadyExists,
    Cancelled,
    Internal,
}

impl StoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidId(_) => ErrorKind::InvalidId,
            StoreError::InvalidVersion(_) => ErrorKind::InvalidVersion,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::VersionNotFound { .. } => ErrorKind::VersionNotFound,
            StoreError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StoreError::Cancelled | StoreError::DeadlineExceeded => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether the error was caused by the caller's input rather than storage.
    pub fn is_input_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvalidId | ErrorKind::InvalidVersion)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
