//! HTTP server for the virtual registry pull-through cache.
//!
//! This crate provides:
//! - Artifact serving for Maven, npm and container registries
//! - The fetch orchestrator with per-instance single-flight coalescing
//! - Upstream selection by position and allow/deny rules
//! - Admin endpoints for registries, upstreams, rules and cleanup policies
//! - The cleanup scheduler and the blob deletion worker

pub mod auth;
pub mod blob_gc;
pub mod cleanup;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod orchestrator;
pub mod routes;
pub mod selection;
pub mod singleflight;
pub mod state;
pub mod upstream;

pub use auth::TraceId;
pub use error::{ApiError, FetchError};
pub use orchestrator::{CacheSource, Orchestrator, ServedArtifact};
pub use routes::create_router;
pub use state::AppState;
pub use upstream::{HttpUpstreamClient, UpstreamClient};
