//! Invalidation dispatcher.
//!
//! Given tags the content source declared stale, resolves every query that
//! depended on any of them, invalidates those keys downstream and then
//! forgets their associations. Forgetting always happens after the
//! invalidations of the same batch have finished; an identifier whose
//! invalidation failed keeps its rows so a redelivered event can retry it.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{info, warn};

use crate::application::downstream::{DownstreamCache, DownstreamError};
use crate::application::repos::{AssociationsRepo, RepoError};
use crate::domain::{CacheTag, QueryId};

#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error("failed to resolve identifiers for stale tags: {0}")]
    Resolve(#[source] RepoError),
    #[error("downstream invalidation failed for {} identifier(s)", failed.len())]
    Downstream {
        failed: Vec<QueryId>,
        #[source]
        source: DownstreamError,
    },
    #[error("failed to prune associations: {0}")]
    Prune(#[source] RepoError),
    #[error("failed to truncate associations: {0}")]
    Truncate(#[source] RepoError),
}

pub struct InvalidationService {
    associations: Arc<dyn AssociationsRepo>,
    cache: Arc<dyn DownstreamCache>,
    concurrency: NonZeroUsize,
}

impl InvalidationService {
    pub fn new(
        associations: Arc<dyn AssociationsRepo>,
        cache: Arc<dyn DownstreamCache>,
        concurrency: NonZeroUsize,
    ) -> Self {
        Self {
            associations,
            cache,
            concurrency,
        }
    }

    /// Invalidate every query that depended on any of `tags`.
    ///
    /// Returns the identifiers that were invalidated and pruned. Every step is
    /// idempotent, so processing the same event twice is harmless.
    #[tracing::instrument(name = "invalidation::process", skip_all, fields(tag_count = tags.len()))]
    pub async fn process_invalidation(
        &self,
        tags: &BTreeSet<CacheTag>,
    ) -> Result<BTreeSet<QueryId>, InvalidationError> {
        if tags.is_empty() {
            return Ok(BTreeSet::new());
        }

        let started = Instant::now();

        let ids = self
            .associations
            .resolve_identifiers_by_tags(tags)
            .await
            .map_err(InvalidationError::Resolve)?;

        if ids.is_empty() {
            info!(
                target = "tagsweep::invalidation",
                tag_count = tags.len(),
                "no cached queries reference the stale tags"
            );
            return Ok(ids);
        }

        let outcomes: Vec<(QueryId, Result<(), DownstreamError>)> = stream::iter(ids.iter().cloned())
            .map(|id| {
                let cache = Arc::clone(&self.cache);
                async move {
                    let outcome = cache.invalidate(&id).await;
                    (id, outcome)
                }
            })
            .buffer_unordered(self.concurrency.get())
            .collect()
            .await;

        let mut invalidated = BTreeSet::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    invalidated.insert(id);
                }
                Err(err) => {
                    counter!("tagsweep_downstream_invalidate_failed_total").increment(1);
                    warn!(
                        target = "tagsweep::invalidation",
                        query_id = %id,
                        error = %err,
                        "downstream invalidation failed"
                    );
                    failed.push(id);
                    first_error.get_or_insert(err);
                }
            }
        }

        let pruned = if invalidated.is_empty() {
            0
        } else {
            self.associations
                .delete_associations_by_identifiers(&invalidated)
                .await
                .map_err(InvalidationError::Prune)?
        };

        counter!("tagsweep_invalidation_identifiers_total").increment(invalidated.len() as u64);
        histogram!("tagsweep_invalidation_ms").record(started.elapsed().as_secs_f64() * 1000.0);

        info!(
            target = "tagsweep::invalidation",
            tag_count = tags.len(),
            invalidated = invalidated.len(),
            failed = failed.len(),
            pruned_rows = pruned,
            "processed stale cache tags"
        );

        match first_error {
            Some(source) => Err(InvalidationError::Downstream { failed, source }),
            None => Ok(invalidated),
        }
    }

    /// Administrative wipe: drop the whole downstream cache, then every association.
    #[tracing::instrument(name = "invalidation::purge_all", skip_all)]
    pub async fn purge_all(&self) -> Result<u64, InvalidationError> {
        self.cache
            .invalidate_all()
            .await
            .map_err(|source| InvalidationError::Downstream {
                failed: Vec::new(),
                source,
            })?;

        let removed = self
            .associations
            .truncate_all()
            .await
            .map_err(InvalidationError::Truncate)?;

        warn!(
            target = "tagsweep::invalidation",
            removed_rows = removed,
            "purged downstream cache and all cache tag associations"
        );

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::Mutex;

    use super::*;
    use crate::application::fingerprint::fingerprint;
    use crate::infra::memory::MemoryAssociations;

    #[derive(Default)]
    struct RecordingCache {
        invalidated: Mutex<Vec<QueryId>>,
        refuse: Mutex<BTreeSet<QueryId>>,
        cleared: Mutex<u32>,
    }

    #[async_trait]
    impl DownstreamCache for RecordingCache {
        async fn invalidate(&self, key: &QueryId) -> Result<(), DownstreamError> {
            if self.refuse.lock().await.contains(key) {
                return Err(DownstreamError::Status {
                    status: 503,
                    body: "busy".into(),
                });
            }
            self.invalidated.lock().await.push(key.clone());
            Ok(())
        }

        async fn invalidate_all(&self) -> Result<(), DownstreamError> {
            *self.cleared.lock().await += 1;
            Ok(())
        }
    }

    fn id(query: &str) -> QueryId {
        fingerprint(query, &Value::Null).unwrap()
    }

    fn tags(names: &[&str]) -> BTreeSet<CacheTag> {
        names.iter().map(|n| CacheTag::new(*n).unwrap()).collect()
    }

    fn service(
        store: Arc<MemoryAssociations>,
        cache: Arc<RecordingCache>,
    ) -> InvalidationService {
        InvalidationService::new(store, cache, NonZeroUsize::new(4).unwrap())
    }

    #[tokio::test]
    async fn invalidates_and_prunes_every_affected_identifier() {
        let store = Arc::new(MemoryAssociations::new());
        let cache = Arc::new(RecordingCache::default());
        let q1 = id("query Q1");

        store
            .upsert_associations(&q1, &tags(&["post-1", "author-5"]))
            .await
            .unwrap();

        let svc = service(store.clone(), cache.clone());
        let resolved = svc.process_invalidation(&tags(&["author-5"])).await.unwrap();

        assert_eq!(resolved, BTreeSet::from([q1.clone()]));
        assert_eq!(*cache.invalidated.lock().await, vec![q1]);
        // The unrelated post-1 row of the same identifier is gone too.
        assert!(store.is_empty().await);

        let second = svc.process_invalidation(&tags(&["post-1"])).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(cache.invalidated.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn disjoint_identifiers_are_untouched() {
        let store = Arc::new(MemoryAssociations::new());
        let cache = Arc::new(RecordingCache::default());
        let (q1, q2) = (id("query Q1"), id("query Q2"));

        store.upsert_associations(&q1, &tags(&["a"])).await.unwrap();
        store.upsert_associations(&q2, &tags(&["b"])).await.unwrap();

        service(store.clone(), cache)
            .process_invalidation(&tags(&["a"]))
            .await
            .unwrap();

        let remaining = store.resolve_identifiers_by_tags(&tags(&["b"])).await.unwrap();
        assert_eq!(remaining, BTreeSet::from([q2]));
    }

    #[tokio::test]
    async fn no_tag_resolves_after_processing() {
        let store = Arc::new(MemoryAssociations::new());
        let cache = Arc::new(RecordingCache::default());
        for (query, names) in [
            ("query Q1", &["a", "b"][..]),
            ("query Q2", &["b", "c"][..]),
            ("query Q3", &["d"][..]),
        ] {
            store.upsert_associations(&id(query), &tags(names)).await.unwrap();
        }

        let stale = tags(&["a", "c", "d"]);
        service(store.clone(), cache)
            .process_invalidation(&stale)
            .await
            .unwrap();

        for tag in stale {
            let ids = store
                .resolve_identifiers_by_tags(&BTreeSet::from([tag]))
                .await
                .unwrap();
            assert!(ids.is_empty());
        }
    }

    #[tokio::test]
    async fn failed_invalidations_keep_their_associations() {
        let store = Arc::new(MemoryAssociations::new());
        let cache = Arc::new(RecordingCache::default());
        let (q1, q2) = (id("query Q1"), id("query Q2"));

        store.upsert_associations(&q1, &tags(&["shared"])).await.unwrap();
        store.upsert_associations(&q2, &tags(&["shared"])).await.unwrap();
        cache.refuse.lock().await.insert(q2.clone());

        let svc = service(store.clone(), cache.clone());
        let err = svc.process_invalidation(&tags(&["shared"])).await.unwrap_err();

        match err {
            InvalidationError::Downstream { failed, .. } => assert_eq!(failed, vec![q2.clone()]),
            other => panic!("unexpected error: {other}"),
        }

        let remaining = store.resolve_identifiers_by_tags(&tags(&["shared"])).await.unwrap();
        assert_eq!(remaining, BTreeSet::from([q2.clone()]));

        // Redelivery after the cache recovers finishes the job.
        cache.refuse.lock().await.clear();
        let retried = svc.process_invalidation(&tags(&["shared"])).await.unwrap();
        assert_eq!(retried, BTreeSet::from([q2]));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn empty_tag_set_is_a_no_op() {
        let store = Arc::new(MemoryAssociations::new());
        let cache = Arc::new(RecordingCache::default());

        let resolved = service(store, cache.clone())
            .process_invalidation(&BTreeSet::new())
            .await
            .unwrap();

        assert!(resolved.is_empty());
        assert!(cache.invalidated.lock().await.is_empty());
    }

    #[tokio::test]
    async fn purge_clears_cache_then_store() {
        let store = Arc::new(MemoryAssociations::new());
        let cache = Arc::new(RecordingCache::default());
        store
            .upsert_associations(&id("query Q1"), &tags(&["a", "b"]))
            .await
            .unwrap();

        let removed = service(store.clone(), cache.clone()).purge_all().await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(*cache.cleared.lock().await, 1);
        assert!(store.is_empty().await);
    }
}
