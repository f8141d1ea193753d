//! HTTP request handlers.

pub mod artifacts;
pub mod cache_entries;
pub mod cleanup;
pub mod common;
pub mod health;
pub mod registries;
pub mod rules;
pub mod upstreams;

pub use artifacts::*;
pub use cache_entries::*;
pub use cleanup::*;
pub use common::*;
pub use health::*;
pub use registries::*;
pub use rules::*;
pub use upstreams::*;
