//! Blob deletion queue repository.

use crate::error::MetadataResult;
use crate::models::BlobDeletionRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Durable queue of released object keys.
#[async_trait]
pub trait BlobDeletionRepo: Send + Sync {
    /// Enqueue a key. Returns false if it was already queued.
    async fn enqueue_blob_deletion(
        &self,
        object_key: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Tasks due at `now` with fewer than `max_attempts` attempts, oldest first.
    async fn claim_due_blob_deletions(
        &self,
        now: OffsetDateTime,
        max_attempts: u32,
        limit: u32,
    ) -> MetadataResult<Vec<BlobDeletionRow>>;

    /// Remove a finished task.
    async fn complete_blob_deletion(&self, object_key: &str) -> MetadataResult<()>;

    /// Record a failed attempt. Returns the new attempt count.
    async fn fail_blob_deletion(
        &self,
        object_key: &str,
        error: &str,
        next_attempt_at: OffsetDateTime,
    ) -> MetadataResult<i32>;

    /// Tasks that exhausted their attempts and wait for an operator.
    async fn list_parked_blob_deletions(
        &self,
        max_attempts: u32,
        limit: u32,
    ) -> MetadataResult<Vec<BlobDeletionRow>>;
}
