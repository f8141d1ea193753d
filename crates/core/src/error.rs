//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid registry kind: {0}")]
    InvalidRegistryKind(String),

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("checksum mismatch ({algorithm}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: &'static str,
        expected: String,
        actual: String,
    },

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid position {position} (must be between 1 and {max})")]
    InvalidPosition { position: u32, max: u32 },

    #[error("upstream limit reached: at most {0} upstreams per registry")]
    TooManyUpstreams(usize),

    #[error("upstream {0} is not part of this ordering")]
    UnknownUpstream(uuid::Uuid),

    #[error("invalid cleanup policy: {0}")]
    InvalidCleanupPolicy(String),

    #[error("invalid relative path: {0}")]
    InvalidPath(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
