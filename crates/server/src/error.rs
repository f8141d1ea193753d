//! API and fetch error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use vreg_metadata::MetadataError;
use vreg_storage::StorageError;

/// Message shared by every artifact not-found cause, so responses do not
/// reveal whether a registry exists, is disabled or simply lacks the path.
pub const ARTIFACT_NOT_FOUND_MESSAGE: &str = "artifact not found";

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// Why serving an artifact failed.
///
/// `Clone` because one outcome is broadcast to every caller waiting on the
/// same in-flight fetch.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FetchError {
    /// Selection left no upstream to try.
    #[error("no upstream available")]
    NoUpstreamAvailable,

    /// Every candidate answered not-found.
    #[error("artifact not found")]
    ArtifactNotFound,

    /// Retries exhausted against every candidate with no stale entry to fall back on.
    #[error("upstream error: {0}")]
    UpstreamTransient(String),

    /// Declared and computed checksums disagree; nothing was persisted.
    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    /// The cache entry upsert kept hitting a constraint.
    #[error("store conflict: {0}")]
    StoreConflict(String),

    #[error("artifact exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    /// A waiter gave up on an in-flight fetch.
    #[error("timed out waiting for upstream fetch")]
    Timeout,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FetchError {
    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoUpstreamAvailable => "no_upstream",
            Self::ArtifactNotFound => "not_found",
            Self::UpstreamTransient(_) => "upstream_transient",
            Self::IntegrityMismatch(_) => "integrity_mismatch",
            Self::StoreConflict(_) => "store_conflict",
            Self::TooLarge { .. } => "too_large",
            Self::Timeout => "timeout",
            Self::Storage(_) => "storage",
            Self::Metadata(_) => "metadata",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoUpstreamAvailable | Self::ArtifactNotFound)
    }
}

impl From<MetadataError> for FetchError {
    fn from(e: MetadataError) -> Self {
        Self::Metadata(e.to_string())
    }
}

impl From<StorageError> for FetchError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Failure of a single cleanup run. The run is recorded as `failed`.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("cleanup policy was disabled during the run")]
    PolicyDisabled,

    #[error("cleanup policy was deleted during the run")]
    PolicyMissing,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Artifact endpoint not-found; always renders the same body.
    #[error("{}", ARTIFACT_NOT_FOUND_MESSAGE)]
    ArtifactNotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Fetch(FetchError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("{0}")]
    Core(#[from] vreg_core::Error),
}

impl From<FetchError> for ApiError {
    fn from(e: FetchError) -> Self {
        if e.is_not_found() {
            Self::ArtifactNotFound
        } else {
            Self::Fetch(e)
        }
    }
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) | Self::ArtifactNotFound => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
            Self::Fetch(e) => match e {
                FetchError::UpstreamTransient(_) | FetchError::TooLarge { .. } => "upstream_error",
                FetchError::IntegrityMismatch(_) => "integrity_mismatch",
                FetchError::StoreConflict(_) => "store_conflict",
                FetchError::Timeout => "upstream_timeout",
                FetchError::NoUpstreamAvailable | FetchError::ArtifactNotFound => "not_found",
                FetchError::Storage(_) => "storage_error",
                FetchError::Metadata(_) => "metadata_error",
                FetchError::Internal(_) => "internal_error",
            },
            Self::Storage(_) => "storage_error",
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => "not_found",
                MetadataError::AlreadyExists(_) | MetadataError::Constraint(_) => "conflict",
                MetadataError::Domain(_) => "bad_request",
                _ => "metadata_error",
            },
            Self::Core(_) => "bad_request",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::ArtifactNotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Fetch(e) => match e {
                FetchError::NoUpstreamAvailable | FetchError::ArtifactNotFound => {
                    StatusCode::NOT_FOUND
                }
                FetchError::UpstreamTransient(_)
                | FetchError::IntegrityMismatch(_)
                | FetchError::TooLarge { .. } => StatusCode::BAD_GATEWAY,
                FetchError::StoreConflict(_) => StatusCode::SERVICE_UNAVAILABLE,
                FetchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                FetchError::Storage(_) | FetchError::Metadata(_) | FetchError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::AlreadyExists(_) | MetadataError::Constraint(_) => {
                    StatusCode::CONFLICT
                }
                MetadataError::Domain(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
