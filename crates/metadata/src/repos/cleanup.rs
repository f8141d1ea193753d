//! Cleanup policy repository.

use crate::error::MetadataResult;
use crate::models::{CleanupPolicyRow, CleanupRunRecord};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for per-group cleanup policies.
///
/// The single-run guarantee lives here: `try_begin_cleanup_run` is a
/// conditional update that only one caller can win.
#[async_trait]
pub trait CleanupPolicyRepo: Send + Sync {
    /// Create or update a group's policy settings. Run state and metrics of
    /// an existing policy are preserved.
    async fn upsert_cleanup_policy(
        &self,
        policy: &CleanupPolicyRow,
    ) -> MetadataResult<CleanupPolicyRow>;

    async fn get_cleanup_policy(&self, group_id: Uuid)
    -> MetadataResult<Option<CleanupPolicyRow>>;

    /// Returns false if no policy existed.
    async fn delete_cleanup_policy(&self, group_id: Uuid) -> MetadataResult<bool>;

    /// Enabled, not running, and `next_run_at` unset or not after `now`.
    async fn list_due_cleanup_policies(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<CleanupPolicyRow>>;

    /// Transition an enabled policy to `running` unless it already is.
    /// Returns false when another run holds it or the policy is disabled.
    async fn try_begin_cleanup_run(
        &self,
        group_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Record a run's result and leave `running`.
    async fn finish_cleanup_run(
        &self,
        group_id: Uuid,
        record: &CleanupRunRecord,
    ) -> MetadataResult<()>;

    /// Mark runs that entered `running` at or before `started_before` as
    /// failed. Returns how many.
    ///
    /// At startup every running row is an orphan, so callers pass `now`.
    /// A live scheduler passes `now - lease` to reclaim runs that never
    /// recorded their result.
    async fn recover_orphaned_cleanup_runs(
        &self,
        started_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<u64>;
}
