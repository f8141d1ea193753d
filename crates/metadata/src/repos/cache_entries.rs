//! Cache entry repository.

use crate::error::MetadataResult;
use crate::models::{CacheEntryRow, NewCacheEntry};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// CRUD over cache entries keyed by (upstream, relative path).
///
/// Every operation that drops a blob reference (delete, eviction, an upsert
/// that replaces the blob) enqueues the old object key on the blob deletion
/// queue in the same transaction.
#[async_trait]
pub trait CacheEntryRepo: Send + Sync {
    /// Look up an entry. No side effects.
    async fn lookup_entry(
        &self,
        upstream_id: Uuid,
        relative_path: &str,
    ) -> MetadataResult<Option<CacheEntryRow>>;

    async fn get_entry(&self, entry_id: Uuid) -> MetadataResult<Option<CacheEntryRow>>;

    /// Insert or update in one statement. Overwrites content fields, resets
    /// `upstream_checked_at` and clears `needs_revalidation`; keeps
    /// `download_count` and `created_at`.
    async fn upsert_entry(&self, entry: &NewCacheEntry) -> MetadataResult<CacheEntryRow>;

    /// Increment the download counter.
    async fn record_download(&self, entry_id: Uuid, at: OffsetDateTime) -> MetadataResult<()>;

    /// Delete an entry. Idempotent: returns `None` if nothing was there.
    async fn delete_entry(
        &self,
        upstream_id: Uuid,
        relative_path: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<CacheEntryRow>>;

    /// Record a 304 revalidation. Returns `None` if the row vanished.
    async fn touch_checked(
        &self,
        upstream_id: Uuid,
        relative_path: &str,
        etag: Option<&str>,
        at: OffsetDateTime,
    ) -> MetadataResult<Option<CacheEntryRow>>;

    /// Flag an entry served as a stale fallback. Returns false if missing.
    async fn mark_needs_revalidation(
        &self,
        upstream_id: Uuid,
        relative_path: &str,
    ) -> MetadataResult<bool>;

    /// Page through an upstream's entries by path.
    async fn list_entries_for_upstream(
        &self,
        upstream_id: Uuid,
        limit: u32,
        offset: u64,
    ) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Entries of a group whose last activity is strictly before `cutoff`,
    /// oldest first.
    async fn list_evictable(
        &self,
        group_id: Uuid,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Delete an entry only if it is still older than `cutoff`. Returns the
    /// deleted row, or `None` if it was touched or removed meanwhile.
    async fn delete_if_evictable(
        &self,
        entry_id: Uuid,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<CacheEntryRow>>;
}
