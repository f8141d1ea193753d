//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::{CleanupStatus, PatternType, RegistryKind, Rule, RuleAction, TargetCoordinate};

// =============================================================================
// Registries and upstreams
// =============================================================================

/// Virtual registry record.
#[derive(Debug, Clone, FromRow)]
pub struct RegistryRow {
    pub registry_id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl RegistryRow {
    /// Parsed registry kind.
    pub fn kind(&self) -> vreg_core::Result<RegistryKind> {
        RegistryKind::parse(&self.kind)
    }
}

/// Upstream record: a remote package index a registry may fetch from.
#[derive(Debug, Clone, FromRow)]
pub struct UpstreamRow {
    pub upstream_id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub kind: String,
    pub url: String,
    /// Key into the `credentials` config table.
    pub credential_ref: Option<String>,
    /// `0` means entries never go stale.
    pub cache_validity_hours: i32,
    pub default_rule_action: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UpstreamRow {
    pub fn kind(&self) -> vreg_core::Result<RegistryKind> {
        RegistryKind::parse(&self.kind)
    }

    pub fn default_rule_action(&self) -> vreg_core::Result<RuleAction> {
        RuleAction::parse(&self.default_rule_action)
    }

    /// Validity window, or `None` if entries never go stale.
    pub fn cache_validity(&self) -> Option<time::Duration> {
        (self.cache_validity_hours > 0)
            .then(|| time::Duration::hours(i64::from(self.cache_validity_hours)))
    }
}

/// An upstream together with its position in one registry.
#[derive(Debug, Clone, FromRow)]
pub struct PositionedUpstreamRow {
    pub position: i32,
    #[sqlx(flatten)]
    pub upstream: UpstreamRow,
}

// =============================================================================
// Upstream rules
// =============================================================================

/// Allow/deny rule attached to an upstream.
#[derive(Debug, Clone, FromRow)]
pub struct RuleRow {
    pub rule_id: Uuid,
    pub upstream_id: Uuid,
    pub position: i32,
    pub pattern: String,
    pub pattern_type: String,
    pub action: String,
    pub target: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl RuleRow {
    /// Convert to the domain rule used by selection.
    pub fn to_rule(&self) -> vreg_core::Result<Rule> {
        Ok(Rule {
            id: self.rule_id,
            position: u32::try_from(self.position).unwrap_or(0),
            pattern: self.pattern.clone(),
            pattern_type: PatternType::parse(&self.pattern_type)?,
            action: RuleAction::parse(&self.action)?,
            target: TargetCoordinate::parse(&self.target)?,
        })
    }
}

// =============================================================================
// Cache entries
// =============================================================================

/// Cached artifact metadata. The body lives in the object store at `object_key`.
#[derive(Debug, Clone, FromRow)]
pub struct CacheEntryRow {
    pub entry_id: Uuid,
    pub upstream_id: Uuid,
    pub group_id: Uuid,
    pub relative_path: String,
    pub object_key: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub checksum_sha1: String,
    pub checksum_md5: Option<String>,
    pub checksum_sha256: String,
    pub integrity_verified: bool,
    pub needs_revalidation: bool,
    pub upstream_checked_at: OffsetDateTime,
    pub download_count: i64,
    pub last_downloaded_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CacheEntryRow {
    /// Whether the entry can be served without asking the upstream.
    pub fn is_fresh(&self, validity: Option<time::Duration>, now: OffsetDateTime) -> bool {
        if self.needs_revalidation {
            return false;
        }
        match validity {
            None => true,
            Some(window) => now - self.upstream_checked_at < window,
        }
    }

    /// Last download, or creation if never downloaded.
    pub fn last_activity(&self) -> OffsetDateTime {
        vreg_core::cleanup::last_activity(self.last_downloaded_at, self.created_at)
    }
}

/// Input to `upsert_entry`: everything a fresh fetch knows about an artifact.
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub upstream_id: Uuid,
    pub group_id: Uuid,
    pub relative_path: String,
    pub object_key: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub checksum_sha1: String,
    pub checksum_md5: Option<String>,
    pub checksum_sha256: String,
    pub integrity_verified: bool,
    pub checked_at: OffsetDateTime,
}

// =============================================================================
// Cleanup policies
// =============================================================================

/// Per-group retention policy and its last run.
#[derive(Debug, Clone, FromRow)]
pub struct CleanupPolicyRow {
    pub group_id: Uuid,
    pub enabled: bool,
    pub cadence_days: i32,
    pub keep_n_days_after_download: i32,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub status: String,
    pub next_run_at: Option<OffsetDateTime>,
    pub last_run_started_at: Option<OffsetDateTime>,
    pub last_run_at: Option<OffsetDateTime>,
    pub last_run_deleted_size: i64,
    pub last_run_deleted_entries_count: i64,
    pub failure_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CleanupPolicyRow {
    pub fn status(&self) -> vreg_core::Result<CleanupStatus> {
        CleanupStatus::parse(&self.status)
    }
}

/// Outcome of a cleanup run, written by `finish_cleanup_run`.
#[derive(Debug, Clone)]
pub struct CleanupRunRecord {
    /// `Completed` or `Failed`.
    pub status: CleanupStatus,
    pub finished_at: OffsetDateTime,
    pub deleted_size: i64,
    pub deleted_entries_count: i64,
    pub failure_message: Option<String>,
    /// Replaces `next_run_at` on success; on failure only fills a missing value.
    pub next_run_at: OffsetDateTime,
}

// =============================================================================
// Blob deletion queue
// =============================================================================

/// A released blob awaiting deletion. `object_key` is the idempotency key.
#[derive(Debug, Clone, FromRow)]
pub struct BlobDeletionRow {
    pub object_key: String,
    pub enqueued_at: OffsetDateTime,
    pub attempts: i32,
    pub next_attempt_at: OffsetDateTime,
    pub last_error: Option<String>,
}
