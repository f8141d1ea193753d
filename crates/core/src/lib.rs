//! Core domain types and shared logic for the virtual registry cache.
//!
//! This crate defines the data model used across all other crates:
//! - Registry kinds and relative path validation
//! - Artifact coordinates and upstream rule evaluation
//! - Upstream ordering
//! - Checksums and per-kind integrity policy
//! - Cleanup policy state machine
//! - Token scopes and capability checks

pub mod authz;
pub mod checksum;
pub mod cleanup;
pub mod config;
pub mod coordinate;
pub mod error;
pub mod integrity;
pub mod ordering;
pub mod registry;
pub mod rule;

pub use authz::{Actor, Capability, Decision, Policy, Resource, TokenIdentity, TokenScope};
pub use checksum::{ArtifactHasher, ChecksumAlgorithm, Checksums};
pub use cleanup::CleanupStatus;
pub use coordinate::Coordinate;
pub use error::{Error, Result};
pub use integrity::{DeclaredChecksums, IntegrityPolicy};
pub use ordering::UpstreamOrder;
pub use registry::{MAX_RULES_PER_UPSTREAM, MAX_UPSTREAMS_PER_REGISTRY, RegistryKind};
pub use rule::{PatternType, Rule, RuleAction, TargetCoordinate};

/// Default cache validity window for new upstreams, in hours.
pub const DEFAULT_CACHE_VALIDITY_HOURS: i32 = 24;
