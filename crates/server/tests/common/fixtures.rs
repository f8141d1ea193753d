//! Test fixtures for registries, upstreams and cache entries.

use bytes::Bytes;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::RegistryKind;
use vreg_metadata::MetadataStore;
use vreg_metadata::models::{NewCacheEntry, RegistryRow, RuleRow, UpstreamRow};

/// Generate deterministic test data based on a seed.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// SHA-256 of data as lowercase hex.
#[allow(dead_code)]
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// SHA-1 of data as lowercase hex.
#[allow(dead_code)]
pub fn sha1_hex(data: &[u8]) -> String {
    Sha1::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Insert an enabled registry in a fresh group.
#[allow(dead_code)]
pub async fn seed_registry(store: &Arc<dyn MetadataStore>, kind: RegistryKind) -> RegistryRow {
    seed_registry_in(store, Uuid::new_v4(), kind).await
}

#[allow(dead_code)]
pub async fn seed_registry_in(
    store: &Arc<dyn MetadataStore>,
    group_id: Uuid,
    kind: RegistryKind,
) -> RegistryRow {
    let now = OffsetDateTime::now_utc();
    let registry = RegistryRow {
        registry_id: Uuid::new_v4(),
        group_id,
        name: format!("{}-{}", kind.as_str(), &Uuid::new_v4().to_string()[..8]),
        kind: kind.as_str().to_string(),
        enabled: true,
        created_at: now,
        updated_at: now,
    };
    store
        .create_registry(&registry)
        .await
        .expect("Failed to create registry");
    registry
}

/// Upstream row for `registry`'s group and kind (not yet stored).
#[allow(dead_code)]
pub fn upstream_row(registry: &RegistryRow, name: &str, url: &str) -> UpstreamRow {
    let now = OffsetDateTime::now_utc();
    UpstreamRow {
        upstream_id: Uuid::new_v4(),
        group_id: registry.group_id,
        name: name.to_string(),
        description: None,
        kind: registry.kind.clone(),
        url: url.to_string(),
        credential_ref: None,
        cache_validity_hours: 24,
        default_rule_action: "allow".to_string(),
        created_at: now,
        updated_at: now,
    }
}

/// Create an upstream and attach it at the end of `registry`.
#[allow(dead_code)]
pub async fn seed_upstream(
    store: &Arc<dyn MetadataStore>,
    registry: &RegistryRow,
    name: &str,
    url: &str,
) -> UpstreamRow {
    let upstream = upstream_row(registry, name, url);
    attach_new(store, registry, upstream).await
}

/// Store `upstream` and attach it at the end of `registry`.
#[allow(dead_code)]
pub async fn attach_new(
    store: &Arc<dyn MetadataStore>,
    registry: &RegistryRow,
    upstream: UpstreamRow,
) -> UpstreamRow {
    store
        .create_upstream(&upstream)
        .await
        .expect("Failed to create upstream");
    store
        .attach_upstream(registry.registry_id, upstream.upstream_id, None)
        .await
        .expect("Failed to attach upstream");
    upstream
}

/// Add a wildcard rule on the group coordinate.
#[allow(dead_code)]
pub async fn seed_rule(
    store: &Arc<dyn MetadataStore>,
    upstream: &UpstreamRow,
    pattern: &str,
    action: &str,
) -> RuleRow {
    let now = OffsetDateTime::now_utc();
    let rule = RuleRow {
        rule_id: Uuid::new_v4(),
        upstream_id: upstream.upstream_id,
        position: 0,
        pattern: pattern.to_string(),
        pattern_type: "wildcard".to_string(),
        action: action.to_string(),
        target: "group".to_string(),
        created_at: now,
        updated_at: now,
    };
    store
        .create_rule(&rule, None)
        .await
        .expect("Failed to create rule")
}

/// Cache entry input for `data` under `path`, checked at `checked_at`.
#[allow(dead_code)]
pub fn new_entry(
    upstream: &UpstreamRow,
    path: &str,
    data: &[u8],
    checked_at: OffsetDateTime,
) -> NewCacheEntry {
    NewCacheEntry {
        upstream_id: upstream.upstream_id,
        group_id: upstream.group_id,
        relative_path: path.to_string(),
        object_key: vreg_storage::new_blob_key(upstream.upstream_id),
        size_bytes: data.len() as i64,
        content_type: Some("application/octet-stream".to_string()),
        etag: Some(format!("\"{}\"", &sha1_hex(data)[..12])),
        checksum_sha1: sha1_hex(data),
        checksum_md5: None,
        checksum_sha256: sha256_hex(data),
        integrity_verified: true,
        checked_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        let a = seeded_bytes(42, 100);
        let b = seeded_bytes(42, 100);
        assert_eq!(a, b);

        let c = seeded_bytes(43, 100);
        assert_ne!(a, c);
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(sha1_hex(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
