//! Registry repository.

use crate::error::MetadataResult;
use crate::models::RegistryRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for virtual registries.
#[async_trait]
pub trait RegistryRepo: Send + Sync {
    /// Create a registry. Names are unique per group.
    async fn create_registry(&self, registry: &RegistryRow) -> MetadataResult<()>;

    async fn get_registry(&self, registry_id: Uuid) -> MetadataResult<Option<RegistryRow>>;

    /// List a group's registries by name.
    async fn list_registries(&self, group_id: Uuid) -> MetadataResult<Vec<RegistryRow>>;

    /// Update name and enabled flag. Kind and group are immutable.
    async fn update_registry(&self, registry: &RegistryRow) -> MetadataResult<()>;

    /// Delete a registry and its upstream ordering. Upstreams themselves are
    /// kept. Returns false if the registry did not exist.
    async fn delete_registry(&self, registry_id: Uuid) -> MetadataResult<bool>;
}
