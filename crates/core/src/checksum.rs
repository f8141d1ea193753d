//! Checksum types and incremental hashing of artifact bodies.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;

/// Supported checksum algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha1,
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }

    /// Length of the hex encoding.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha1 => 40,
            Self::Md5 => 32,
            Self::Sha256 => 64,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checksums computed over a stored blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub sha1: String,
    /// `None` when the integrity policy skips MD5.
    pub md5: Option<String>,
    pub sha256: String,
}

impl Checksums {
    /// Compute checksums over an in-memory buffer.
    pub fn compute(data: &[u8], with_md5: bool) -> Self {
        let mut hasher = ArtifactHasher::new(with_md5);
        hasher.update(data);
        hasher.finalize()
    }

    /// Get the hex digest for an algorithm, if computed.
    pub fn get(&self, algorithm: ChecksumAlgorithm) -> Option<&str> {
        match algorithm {
            ChecksumAlgorithm::Sha1 => Some(&self.sha1),
            ChecksumAlgorithm::Md5 => self.md5.as_deref(),
            ChecksumAlgorithm::Sha256 => Some(&self.sha256),
        }
    }
}

/// Incremental hasher fed with body chunks as they stream from the upstream.
pub struct ArtifactHasher {
    sha1: Sha1,
    md5: Option<Md5>,
    sha256: Sha256,
    size: u64,
}

impl ArtifactHasher {
    pub fn new(with_md5: bool) -> Self {
        Self {
            sha1: Sha1::new(),
            md5: with_md5.then(Md5::new),
            sha256: Sha256::new(),
            size: 0,
        }
    }

    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.sha1.update(data);
        if let Some(md5) = self.md5.as_mut() {
            md5.update(data);
        }
        self.sha256.update(data);
        self.size += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finalize and return the hex digests.
    pub fn finalize(self) -> Checksums {
        Checksums {
            sha1: to_hex(&self.sha1.finalize()),
            md5: self.md5.map(|m| to_hex(&m.finalize())),
            sha256: to_hex(&self.sha256.finalize()),
        }
    }
}

/// Encode bytes as lowercase hex.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Normalize a declared hex digest, rejecting anything of the wrong shape.
pub fn normalize_hex(algorithm: ChecksumAlgorithm, value: &str) -> crate::Result<String> {
    let trimmed = value.trim().to_ascii_lowercase();
    if trimmed.len() != algorithm.hex_len() || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(crate::Error::InvalidChecksum(format!(
            "expected {} hex chars for {algorithm}, got '{value}'",
            algorithm.hex_len()
        )));
    }
    Ok(trimmed)
}

/// Decode a base64 digest (as sent in `Content-MD5`) into lowercase hex.
pub fn base64_to_hex(algorithm: ChecksumAlgorithm, value: &str) -> crate::Result<String> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|e| crate::Error::InvalidChecksum(e.to_string()))?;
    if bytes.len() * 2 != algorithm.hex_len() {
        return Err(crate::Error::InvalidChecksum(format!(
            "expected {} bytes for {algorithm}, got {}",
            algorithm.hex_len() / 2,
            bytes.len()
        )));
    }
    Ok(to_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        let sums = Checksums::compute(b"hello world", true);
        assert_eq!(sums.sha1, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert_eq!(sums.md5.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
        assert_eq!(
            sums.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_md5_skipped() {
        let sums = Checksums::compute(b"hello world", false);
        assert!(sums.md5.is_none());
        assert!(sums.get(ChecksumAlgorithm::Md5).is_none());
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = ArtifactHasher::new(true);
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.size(), 11);
        assert_eq!(hasher.finalize(), Checksums::compute(b"hello world", true));
    }

    #[test]
    fn test_normalize_hex() {
        let upper = "2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED";
        assert_eq!(
            normalize_hex(ChecksumAlgorithm::Sha1, upper).unwrap(),
            upper.to_ascii_lowercase()
        );
        assert!(normalize_hex(ChecksumAlgorithm::Sha1, "abc").is_err());
        assert!(normalize_hex(ChecksumAlgorithm::Md5, &"z".repeat(32)).is_err());
    }

    #[test]
    fn test_content_md5_base64() {
        // MD5("hello world") in base64
        let hex = base64_to_hex(ChecksumAlgorithm::Md5, "XrY7u+Ae7tCTyyK7j1rNww==").unwrap();
        assert_eq!(hex, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }
}
