//! Contract of the cache that stores query results keyed by `QueryId`.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{CacheTag, QueryId};

/// Payload held by a cache that also stores query results.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub data: Value,
    pub cache_tags: BTreeSet<CacheTag>,
}

#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("downstream cache request failed: {0}")]
    Transport(String),
    #[error("downstream cache answered with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("{given} tags exceed the per-call limit of {limit}")]
    TagLimitExceeded { limit: usize, given: usize },
}

impl DownstreamError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

/// External cache keyed by query identifier.
///
/// `invalidate` is synchronous-equivalent: once it returns `Ok`, the next
/// read of that key observes a miss. Both invalidation calls are idempotent.
#[async_trait]
pub trait DownstreamCache: Send + Sync {
    async fn invalidate(&self, key: &QueryId) -> Result<(), DownstreamError>;

    /// Drop every entry; used by the administrative wipe.
    async fn invalidate_all(&self) -> Result<(), DownstreamError>;

    /// Maximum number of tags accepted by one `attach_tags` call, if the cache is tag-aware.
    fn tag_limit(&self) -> Option<NonZeroUsize> {
        None
    }

    /// Cache-populating call that attaches `tags` to the entry stored under `key`.
    async fn attach_tags(&self, _key: &QueryId, _tags: &[CacheTag]) -> Result<(), DownstreamError> {
        Ok(())
    }

    /// Read-through lookup for caches that also hold the payload.
    ///
    /// Only entries with recorded tags are served.
    async fn lookup(&self, _key: &QueryId) -> Option<CachedEntry> {
        None
    }

    /// Invalidation generation observed before fetching `key`.
    async fn generation(&self, _key: &QueryId) -> u64 {
        0
    }

    /// Store the payload fetched after reading `generation`. The payload is
    /// discarded when `key` was invalidated since, or carries no tags.
    async fn store(&self, _key: &QueryId, _data: &Value, _generation: u64) {}
}
