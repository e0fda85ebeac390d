//! Domain layer types and invariants.

pub mod error;
pub mod types;

pub use types::{CacheTag, QueryId, parse_cache_tags_header};
