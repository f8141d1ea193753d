pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{drain, seeded_bytes, sha256_hex};
