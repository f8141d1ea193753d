//! Repository traits for metadata operations.

pub mod blob_deletions;
pub mod cache_entries;
pub mod cleanup;
pub mod registries;
pub mod rules;
pub mod upstreams;

pub use blob_deletions::BlobDeletionRepo;
pub use cache_entries::CacheEntryRepo;
pub use cleanup::CleanupPolicyRepo;
pub use registries::RegistryRepo;
pub use rules::RuleRepo;
pub use upstreams::{UpstreamDeleteStats, UpstreamRepo};
