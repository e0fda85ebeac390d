//! Repository traits describing persistence adapters.

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{CacheTag, QueryId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

/// Durable many-to-many index between query identifiers and cache tags.
///
/// Every operation is idempotent and safe to call concurrently from
/// independent processes; the backing store provides the atomicity.
#[async_trait]
pub trait AssociationsRepo: Send + Sync {
    /// Record that `id` depends on every tag in `tags`.
    ///
    /// Pairs that already exist are left untouched. Either every pair is
    /// visible after a successful return or the call failed.
    async fn upsert_associations(
        &self,
        id: &QueryId,
        tags: &BTreeSet<CacheTag>,
    ) -> Result<(), RepoError>;

    /// Distinct identifiers referencing any of `tags`.
    async fn resolve_identifiers_by_tags(
        &self,
        tags: &BTreeSet<CacheTag>,
    ) -> Result<BTreeSet<QueryId>, RepoError>;

    /// Remove every association of the given identifiers, returning the number of rows removed.
    async fn delete_associations_by_identifiers(
        &self,
        ids: &BTreeSet<QueryId>,
    ) -> Result<u64, RepoError>;

    /// Remove every association, returning the number of rows removed.
    async fn truncate_all(&self) -> Result<u64, RepoError>;

    async fn health_check(&self) -> Result<(), RepoError> {
        Ok(())
    }
}
