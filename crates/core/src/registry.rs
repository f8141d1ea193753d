//! Registry kinds and relative path handling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of upstreams attached to one registry.
pub const MAX_UPSTREAMS_PER_REGISTRY: usize = 20;

/// Maximum number of rules attached to one upstream.
pub const MAX_RULES_PER_UPSTREAM: usize = 50;

/// Package ecosystem served by a virtual registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Maven,
    Npm,
    Container,
}

impl RegistryKind {
    /// Parse from the lowercase name used in URLs and the database.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "maven" => Ok(Self::Maven),
            "npm" => Ok(Self::Npm),
            "container" => Ok(Self::Container),
            other => Err(crate::Error::InvalidRegistryKind(other.to_string())),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maven => "maven",
            Self::Npm => "npm",
            Self::Container => "container",
        }
    }

    /// Content type to use when the upstream does not send one.
    pub fn fallback_content_type(&self) -> &'static str {
        match self {
            Self::Maven => "application/octet-stream",
            Self::Npm => "application/octet-stream",
            Self::Container => "application/vnd.oci.image.manifest.v1+json",
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize and validate a client-supplied relative artifact path.
///
/// Leading slashes are stripped. Empty segments, `.` and `..` are rejected so a
/// path can never escape its upstream when joined onto the base URL.
pub fn normalize_relative_path(path: &str) -> crate::Result<String> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(crate::Error::InvalidPath("path is empty".to_string()));
    }
    if trimmed.len() > 1024 {
        return Err(crate::Error::InvalidPath("path is too long".to_string()));
    }
    if trimmed.contains('\0') || trimmed.contains('\\') {
        return Err(crate::Error::InvalidPath(
            "path contains forbidden characters".to_string(),
        ));
    }
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(crate::Error::InvalidPath(format!(
                "invalid path segment in '{trimmed}'"
            )));
        }
    }
    Ok(trimmed.to_string())
}
