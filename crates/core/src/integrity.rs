//! Per-kind integrity verification policy.

use crate::checksum::{ChecksumAlgorithm, Checksums};
use crate::registry::RegistryKind;
use serde::{Deserialize, Serialize};

/// Integrity policy for one registry kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityPolicy {
    /// Compute and store an MD5 digest.
    #[serde(default = "default_true")]
    pub compute_md5: bool,
    /// Verify checksums the upstream declares alongside the body.
    #[serde(default = "default_true")]
    pub verify_declared: bool,
}

fn default_true() -> bool {
    true
}

impl IntegrityPolicy {
    /// Built-in default for a registry kind.
    ///
    /// Container registries address content by sha256 digest, so MD5 is not
    /// computed for them.
    pub fn default_for(kind: RegistryKind) -> Self {
        match kind {
            RegistryKind::Maven | RegistryKind::Npm => Self {
                compute_md5: true,
                verify_declared: true,
            },
            RegistryKind::Container => Self {
                compute_md5: false,
                verify_declared: true,
            },
        }
    }
}

/// Checksums an upstream declared for a response body (normalized hex).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeclaredChecksums {
    pub sha1: Option<String>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
}

impl DeclaredChecksums {
    pub fn is_empty(&self) -> bool {
        self.sha1.is_none() && self.md5.is_none() && self.sha256.is_none()
    }

    fn iter(&self) -> impl Iterator<Item = (ChecksumAlgorithm, &str)> {
        [
            (ChecksumAlgorithm::Sha1, self.sha1.as_deref()),
            (ChecksumAlgorithm::Md5, self.md5.as_deref()),
            (ChecksumAlgorithm::Sha256, self.sha256.as_deref()),
        ]
        .into_iter()
        .filter_map(|(alg, value)| value.map(|v| (alg, v)))
    }
}

/// Verify computed checksums against what the upstream declared.
///
/// Returns `Ok(true)` when at least one declared checksum was compared,
/// `Ok(false)` when verification was skipped or nothing comparable was
/// declared. An algorithm that was not computed (MD5 under a skipping policy)
/// is ignored rather than treated as a mismatch.
pub fn verify(
    policy: &IntegrityPolicy,
    declared: &DeclaredChecksums,
    computed: &Checksums,
) -> crate::Result<bool> {
    if !policy.verify_declared {
        return Ok(false);
    }

    let mut verified = false;
    for (algorithm, expected) in declared.iter() {
        let Some(actual) = computed.get(algorithm) else {
            continue;
        };
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(crate::Error::ChecksumMismatch {
                algorithm: algorithm.as_str(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        verified = true;
    }
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn computed() -> Checksums {
        Checksums::compute(b"artifact", true)
    }

    #[test]
    fn test_container_default_skips_md5() {
        let policy = IntegrityPolicy::default_for(RegistryKind::Container);
        assert!(!policy.compute_md5);
        assert!(policy.verify_declared);
        assert!(IntegrityPolicy::default_for(RegistryKind::Maven).compute_md5);
    }

    #[test]
    fn test_matching_sha1_verifies() {
        let sums = computed();
        let declared = DeclaredChecksums {
            sha1: Some(sums.sha1.to_uppercase()),
            ..Default::default()
        };
        let policy = IntegrityPolicy::default_for(RegistryKind::Maven);
        assert!(verify(&policy, &declared, &sums).unwrap());
    }

    #[test]
    fn test_mismatch_is_error() {
        let sums = computed();
        let declared = DeclaredChecksums {
            sha256: Some("0".repeat(64)),
            ..Default::default()
        };
        let policy = IntegrityPolicy::default_for(RegistryKind::Container);
        let err = verify(&policy, &declared, &sums).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::ChecksumMismatch {
                algorithm: "sha256",
                ..
            }
        ));
    }

    #[test]
    fn test_uncomputed_md5_ignored() {
        let sums = Checksums::compute(b"artifact", false);
        let declared = DeclaredChecksums {
            md5: Some("0".repeat(32)),
            ..Default::default()
        };
        let policy = IntegrityPolicy::default_for(RegistryKind::Container);
        assert!(!verify(&policy, &declared, &sums).unwrap());
    }

    #[test]
    fn test_verification_disabled() {
        let sums = computed();
        let declared = DeclaredChecksums {
            sha1: Some("0".repeat(40)),
            ..Default::default()
        };
        let policy = IntegrityPolicy {
            compute_md5: true,
            verify_declared: false,
        };
        assert!(!verify(&policy, &declared, &sums).unwrap());
    }
}
