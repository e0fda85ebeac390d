use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::{query, query_scalar};

use crate::application::repos::{AssociationsRepo, RepoError};
use crate::domain::{CacheTag, QueryId};

use super::{PostgresRepositories, map_sqlx_error};

const UPSERT_SQL: &str = "INSERT INTO query_cache_tags (query_id, cache_tag) \
    SELECT $1, tag FROM UNNEST($2::text[]) AS t(tag) \
    ON CONFLICT DO NOTHING";
const RESOLVE_SQL: &str =
    "SELECT DISTINCT query_id FROM query_cache_tags WHERE cache_tag = ANY($1::text[])";
const DELETE_SQL: &str = "DELETE FROM query_cache_tags WHERE query_id = ANY($1::text[])";
const TRUNCATE_SQL: &str = "DELETE FROM query_cache_tags";

/// Split a set into owned string chunks suitable for an array bind.
fn chunked<'a, T, I>(items: I, size: usize) -> Vec<Vec<String>>
where
    T: AsRef<str> + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let all: Vec<String> = items
        .into_iter()
        .map(|item| item.as_ref().to_owned())
        .collect();
    all.chunks(size).map(<[String]>::to_vec).collect()
}

#[async_trait]
impl AssociationsRepo for PostgresRepositories {
    async fn upsert_associations(
        &self,
        id: &QueryId,
        tags: &BTreeSet<CacheTag>,
    ) -> Result<(), RepoError> {
        if tags.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        for chunk in chunked(tags, self.batch_size.get()) {
            query(UPSERT_SQL)
                .bind(id.as_str())
                .bind(chunk)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn resolve_identifiers_by_tags(
        &self,
        tags: &BTreeSet<CacheTag>,
    ) -> Result<BTreeSet<QueryId>, RepoError> {
        let mut ids = BTreeSet::new();
        for chunk in chunked(tags, self.batch_size.get()) {
            let rows: Vec<String> = query_scalar::<_, String>(RESOLVE_SQL)
                .bind(chunk)
                .fetch_all(self.pool())
                .await
                .map_err(map_sqlx_error)?;

            for raw in rows {
                let id = QueryId::parse(raw).map_err(|err| RepoError::integrity(err.to_string()))?;
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    async fn delete_associations_by_identifiers(
        &self,
        ids: &BTreeSet<QueryId>,
    ) -> Result<u64, RepoError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let mut removed = 0;
        for chunk in chunked(ids, self.batch_size.get()) {
            removed += query(DELETE_SQL)
                .bind(chunk)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected();
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(removed)
    }

    async fn truncate_all(&self) -> Result<u64, RepoError> {
        let result = query(TRUNCATE_SQL)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        self.ping().await.map_err(map_sqlx_error)
    }
}
