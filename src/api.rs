//! Framework-agnostic request handling for the record endpoints.
//!
//! Parses path parameters and JSON bodies, calls the service, and renders
//! JSON responses with HTTP-style status codes. The actual HTTP server and
//! router are wired by the consumer:
//!
//! - `GET  /records/{id}`                    → [`get_record`]
//! - `GET  /records/{id}/versions`           → [`get_versions`]
//! - `GET  /records/{id}/versions/{version}` → [`get_record_version`]
//! - `POST /records/{id}`                    → [`post_record`]
//! - `GET  /health`                          → [`health`]

use crate::cancel::CancelToken;
use crate::error::{ErrorKind, StoreError};
use crate::service::VersionedRecordService;
use crate::types::{Mutations, VersionInfo};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

/// Opaque message returned for every internal failure.
pub const INTERNAL_ERROR: &str = "internal error";

/// A rendered response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// HTTP-style status code.
    pub status: u16,
    /// JSON response body.
    pub body: Value,
}

impl ApiResponse {
    /// Build a success (200) response.
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    /// Build a `{"error": message}` response.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    /// Map a store error to a response. Internal failures are logged here and
    /// their detail never reaches the body.
    pub fn from_error(err: &StoreError) -> Self {
        match err.kind() {
            ErrorKind::InvalidId => Self::error(400, "invalid id; id must be a positive number"),
            ErrorKind::InvalidVersion => {
                Self::error(400, "invalid version; version must be a positive number")
            }
            ErrorKind::NotFound => match err {
                StoreError::NotFound(id) => {
                    Self::error(404, format!("record of id {} does not exist", id))
                }
                _ => Self::error(404, "record does not exist"),
            },
            ErrorKind::VersionNotFound => match err {
                StoreError::VersionNotFound { id, version } => Self::error(
                    404,
                    format!("record version {}@{} does not exist", id, version),
                ),
                _ => Self::error(404, "record version does not exist"),
            },
            ErrorKind::AlreadyExists => Self::error(409, "record already exists"),
            ErrorKind::Cancelled => Self::error(503, "request cancelled"),
            ErrorKind::Internal => {
                error!(error = %err, "request failed");
                Self::error(500, INTERNAL_ERROR)
            }
        }
    }
}

impl From<StoreError> for ApiResponse {
    fn from(err: StoreError) -> Self {
        Self::from_error(&err)
    }
}

/// Parse a record identifier path parameter: a positive base-10 `i32`, no
/// surrounding whitespace.
pub fn parse_id(raw: &str) -> Result<i64, ApiResponse> {
    match raw.parse::<i32>() {
        Ok(id) if id > 0 => Ok(i64::from(id)),
        _ => Err(ApiResponse::from_error(&StoreError::InvalidId(0))),
    }
}

/// Parse a version number path parameter, with the same rules as [`parse_id`].
pub fn parse_version(raw: &str) -> Result<i64, ApiResponse> {
    match raw.parse::<i32>() {
        Ok(version) if version > 0 => Ok(i64::from(version)),
        _ => Err(ApiResponse::from_error(&StoreError::InvalidVersion(0))),
    }
}

/// Parse a request body of the form `{"field": "value" | null, ...}`.
pub fn parse_mutations(body: &[u8]) -> Result<Mutations, ApiResponse> {
    serde_json::from_slice(body)
        .map_err(|_| ApiResponse::error(400, "invalid input; could not parse json"))
}

/// `GET /health`
pub fn health() -> ApiResponse {
    ApiResponse::ok(json!({ "ok": true }))
}

/// `GET /records/{id}`: latest state of a record.
pub fn get_record(service: &VersionedRecordService, cx: &CancelToken, id: &str) -> ApiResponse {
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match service.get_record(cx, id) {
        Ok(record) => ApiResponse::ok(json!(record)),
        Err(e) => e.into(),
    }
}

/// `GET /records/{id}/versions`: version listing, newest first.
pub fn get_versions(service: &VersionedRecordService, cx: &CancelToken, id: &str) -> ApiResponse {
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match service.list_versions(cx, id) {
        Ok(versions) => ApiResponse::ok(json!({
            "id": id,
            "versions": versions.iter().map(version_json).collect::<Vec<_>>(),
        })),
        Err(e) => e.into(),
    }
}

/// `GET /records/{id}/versions/{version}`: a record as of one version.
pub fn get_record_version(
    service: &VersionedRecordService,
    cx: &CancelToken,
    id: &str,
    version: &str,
) -> ApiResponse {
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let version = match parse_version(version) {
        Ok(version) => version,
        Err(response) => return response,
    };

    match service.get_record_version(cx, id, version) {
        Ok(record) => ApiResponse::ok(json!(record)),
        Err(e) => e.into(),
    }
}

/// `POST /records/{id}`: update an existing record with the body's
/// mutations, or create it from the body's non-null fields.
pub fn post_record(
    service: &VersionedRecordService,
    cx: &CancelToken,
    id: &str,
    body: &[u8],
) -> ApiResponse {
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let mutations = match parse_mutations(body) {
        Ok(mutations) => mutations,
        Err(response) => return response,
    };

    match service.post_record(cx, id, &mutations) {
        Ok(record) => ApiResponse::ok(json!(record)),
        Err(e) => e.into(),
    }
}

fn version_json(info: &VersionInfo) -> Value {
    json!({
        "version": info.version.0,
        "created_at": info.created_at.to_rfc3339(),
    })
}
