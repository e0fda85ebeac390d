//! Request-scoped query execution.
//!
//! A [`QueryScope`] lives for one logical request. Identical (query, variables)
//! pairs issued through the same scope reach the content source at most once;
//! the memo is dropped with the scope.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::application::content::{ContentClient, FetchError, TaggedResult};
use crate::application::downstream::DownstreamCache;
use crate::application::fingerprint::fingerprint;
use crate::domain::QueryId;

pub struct QueryService {
    client: Arc<ContentClient>,
    cache: Arc<dyn DownstreamCache>,
}

impl QueryService {
    pub fn new(client: Arc<ContentClient>, cache: Arc<dyn DownstreamCache>) -> Self {
        Self { client, cache }
    }

    pub fn scope(&self) -> QueryScope<'_> {
        QueryScope {
            service: self,
            memo: Mutex::new(HashMap::new()),
        }
    }

    async fn load(
        &self,
        query_id: &QueryId,
        query: &str,
        variables: &Value,
    ) -> Result<TaggedResult, FetchError> {
        if let Some(entry) = self.cache.lookup(query_id).await {
            debug!(
                target = "tagsweep::query",
                query_id = %query_id,
                "served query from downstream cache"
            );
            return Ok(TaggedResult {
                query_id: query_id.clone(),
                data: entry.data,
                cache_tags: entry.cache_tags,
                tracked: true,
            });
        }

        // Read before the upstream call so an invalidation racing the fetch
        // makes the cache refuse this payload.
        let generation = self.cache.generation(query_id).await;
        let result = self.client.fetch_with_tags(query, variables).await?;
        if result.tracked {
            self.cache
                .store(&result.query_id, &result.data, generation)
                .await;
        }
        Ok(result)
    }
}

type Slot = Arc<OnceCell<TaggedResult>>;

pub struct QueryScope<'a> {
    service: &'a QueryService,
    memo: Mutex<HashMap<QueryId, Slot>>,
}

impl QueryScope<'_> {
    /// Execute a query, reusing an earlier result of this scope when the
    /// fingerprint matches. Failures are not memoized.
    pub async fn execute(&self, query: &str, variables: &Value) -> Result<TaggedResult, FetchError> {
        let query_id = fingerprint(query, variables)?;

        let slot = {
            let mut memo = self.memo.lock().await;
            Arc::clone(memo.entry(query_id.clone()).or_default())
        };

        let result = slot
            .get_or_try_init(|| self.service.load(&query_id, query, variables))
            .await?;
        Ok(result.clone())
    }

    /// Number of distinct queries resolved so far.
    pub async fn len(&self) -> usize {
        let memo = self.memo.lock().await;
        memo.values().filter(|slot| slot.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
