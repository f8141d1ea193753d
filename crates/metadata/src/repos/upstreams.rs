//! Upstream repository, including per-registry ordering.

use crate::error::MetadataResult;
use crate::models::{PositionedUpstreamRow, UpstreamRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// What an upstream delete removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamDeleteStats {
    pub entries_deleted: u64,
    pub blobs_enqueued: u64,
    pub registries_detached: u64,
}

/// Repository for upstreams and registry ordering.
///
/// Every ordering mutation rewrites the registry's full position assignment
/// in one transaction, so positions stay 1-based and contiguous.
#[async_trait]
pub trait UpstreamRepo: Send + Sync {
    async fn create_upstream(&self, upstream: &UpstreamRow) -> MetadataResult<()>;

    async fn get_upstream(&self, upstream_id: Uuid) -> MetadataResult<Option<UpstreamRow>>;

    /// Update mutable fields (name, description, url, credential ref,
    /// validity window, default rule action).
    async fn update_upstream(&self, upstream: &UpstreamRow) -> MetadataResult<()>;

    /// Delete an upstream, its rules and cache entries, and detach it from
    /// every registry. Blobs of removed entries go on the deletion queue in
    /// the same transaction. Returns `None` if the upstream did not exist.
    async fn delete_upstream(
        &self,
        upstream_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<UpstreamDeleteStats>>;

    /// Attach an upstream to a registry at a 1-based position, or at the end.
    /// Returns the assigned position.
    async fn attach_upstream(
        &self,
        registry_id: Uuid,
        upstream_id: Uuid,
        position: Option<u32>,
    ) -> MetadataResult<u32>;

    /// Detach an upstream from a registry; later positions shift up.
    async fn detach_upstream(&self, registry_id: Uuid, upstream_id: Uuid) -> MetadataResult<()>;

    /// Move an attached upstream to a new 1-based position.
    async fn move_upstream(
        &self,
        registry_id: Uuid,
        upstream_id: Uuid,
        position: u32,
    ) -> MetadataResult<()>;

    /// A registry's upstreams in position order.
    async fn list_registry_upstreams(
        &self,
        registry_id: Uuid,
    ) -> MetadataResult<Vec<PositionedUpstreamRow>>;
}
