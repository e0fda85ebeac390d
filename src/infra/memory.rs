//! In-process association store.
//!
//! Used when no database is configured and by tests. Associations do not
//! survive a restart, so invalidation completeness is only guaranteed for
//! queries fetched by the current process.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::application::repos::{AssociationsRepo, RepoError};
use crate::domain::{CacheTag, QueryId};

#[derive(Default)]
pub struct MemoryAssociations {
    rows: RwLock<BTreeSet<(QueryId, CacheTag)>>,
}

impl MemoryAssociations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored (identifier, tag) pairs.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl AssociationsRepo for MemoryAssociations {
    async fn upsert_associations(
        &self,
        id: &QueryId,
        tags: &BTreeSet<CacheTag>,
    ) -> Result<(), RepoError> {
        let mut rows = self.rows.write().await;
        for tag in tags {
            rows.insert((id.clone(), tag.clone()));
        }
        Ok(())
    }

    async fn resolve_identifiers_by_tags(
        &self,
        tags: &BTreeSet<CacheTag>,
    ) -> Result<BTreeSet<QueryId>, RepoError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|(_, tag)| tags.contains(tag))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn delete_associations_by_identifiers(
        &self,
        ids: &BTreeSet<QueryId>,
    ) -> Result<u64, RepoError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|(id, _)| !ids.contains(id));
        Ok((before - rows.len()) as u64)
    }

    async fn truncate_all(&self) -> Result<u64, RepoError> {
        let mut rows = self.rows.write().await;
        let removed = rows.len() as u64;
        rows.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::fingerprint::fingerprint;

    fn id(query: &str) -> QueryId {
        fingerprint(query, &serde_json::Value::Null).unwrap()
    }

    fn tags(names: &[&str]) -> BTreeSet<CacheTag> {
        names.iter().map(|n| CacheTag::new(*n).unwrap()).collect()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryAssociations::new();
        let q = id("query A");

        store.upsert_associations(&q, &tags(&["a", "b"])).await.unwrap();
        store.upsert_associations(&q, &tags(&["a", "b"])).await.unwrap();

        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn resolve_is_a_distinct_union() {
        let store = MemoryAssociations::new();
        let (q1, q2, q3) = (id("query A"), id("query B"), id("query C"));

        store.upsert_associations(&q1, &tags(&["a", "b"])).await.unwrap();
        store.upsert_associations(&q2, &tags(&["b"])).await.unwrap();
        store.upsert_associations(&q3, &tags(&["c"])).await.unwrap();

        let resolved = store.resolve_identifiers_by_tags(&tags(&["a", "b"])).await.unwrap();
        assert_eq!(resolved, BTreeSet::from([q1, q2]));
    }

    #[tokio::test]
    async fn delete_removes_every_tag_of_the_identifier() {
        let store = MemoryAssociations::new();
        let (q1, q2) = (id("query A"), id("query B"));

        store.upsert_associations(&q1, &tags(&["a", "b"])).await.unwrap();
        store.upsert_associations(&q2, &tags(&["b"])).await.unwrap();

        let removed = store
            .delete_associations_by_identifiers(&BTreeSet::from([q1.clone()]))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let again = store
            .delete_associations_by_identifiers(&BTreeSet::from([q1]))
            .await
            .unwrap();
        assert_eq!(again, 0);

        let resolved = store.resolve_identifiers_by_tags(&tags(&["b"])).await.unwrap();
        assert_eq!(resolved, BTreeSet::from([q2]));
    }

    #[tokio::test]
    async fn truncate_empties_the_store() {
        let store = MemoryAssociations::new();
        store
            .upsert_associations(&id("query A"), &tags(&["a", "b"]))
            .await
            .unwrap();

        assert_eq!(store.truncate_all().await.unwrap(), 2);
        assert!(store.is_empty().await);
    }
}
