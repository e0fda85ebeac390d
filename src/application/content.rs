//! Fetch-and-tag client for the upstream content source.
//!
//! Each successful fetch records which cache tags the result depended on,
//! keyed by the query identifier, before handing the data back. Recording is
//! best-effort: a bookkeeping failure is logged and counted, never returned.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::downstream::DownstreamCache;
use crate::application::fingerprint::{FingerprintError, fingerprint};
use crate::application::repos::AssociationsRepo;
use crate::domain::{CacheTag, QueryId, parse_cache_tags_header};

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Body sent to the upstream content source.
#[derive(Debug, Serialize)]
pub struct QueryRequest<'a> {
    pub query: &'a str,
    pub variables: &'a Value,
}

/// Raw upstream answer, before the envelope is decoded.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: StatusCode,
    /// Value of the cache tag header, if the source sent one.
    pub cache_tags: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, Error)]
#[error("upstream transport error: {0}")]
pub struct TransportError(pub String);

/// Issues one query to the content source, asking for cache tag metadata.
#[async_trait]
pub trait ContentTransport: Send + Sync {
    async fn execute(&self, request: &QueryRequest<'_>) -> Result<UpstreamReply, TransportError>;
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    InvalidQuery(#[from] FingerprintError),
    #[error("upstream fetch failed: {message}")]
    UpstreamFetch {
        status: Option<u16>,
        message: String,
    },
    #[error("upstream query returned errors: {errors}")]
    UpstreamQuery { errors: Value },
}

/// Data returned by the source together with the tags it depended on.
#[derive(Debug, Clone, Serialize)]
pub struct TaggedResult {
    pub query_id: QueryId,
    pub data: Value,
    pub cache_tags: BTreeSet<CacheTag>,
    /// Whether every tag was recorded in the association store and attached
    /// downstream. Results that are not fully tracked must not be cached.
    #[serde(skip)]
    pub tracked: bool,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Value>,
}

pub struct ContentClient {
    transport: Arc<dyn ContentTransport>,
    associations: Arc<dyn AssociationsRepo>,
    cache: Arc<dyn DownstreamCache>,
}

impl ContentClient {
    pub fn new(
        transport: Arc<dyn ContentTransport>,
        associations: Arc<dyn AssociationsRepo>,
        cache: Arc<dyn DownstreamCache>,
    ) -> Self {
        Self {
            transport,
            associations,
            cache,
        }
    }

    /// Execute `query` with `variables` and record its cache tag dependencies.
    ///
    /// Tags are re-recorded on every execution; skipping the write when the
    /// tags look unchanged would leave entries untracked after a concurrent
    /// invalidation pruned them.
    #[tracing::instrument(name = "content::fetch_with_tags", skip_all)]
    pub async fn fetch_with_tags(
        &self,
        query: &str,
        variables: &Value,
    ) -> Result<TaggedResult, FetchError> {
        let query_id = fingerprint(query, variables)?;

        let reply = self
            .transport
            .execute(&QueryRequest { query, variables })
            .await
            .map_err(|err| {
                counter!("tagsweep_upstream_fetch_total", "outcome" => "transport_error")
                    .increment(1);
                FetchError::UpstreamFetch {
                    status: None,
                    message: err.to_string(),
                }
            })?;

        if !reply.status.is_success() {
            counter!("tagsweep_upstream_fetch_total", "outcome" => "http_error").increment(1);
            return Err(FetchError::UpstreamFetch {
                status: Some(reply.status.as_u16()),
                message: format!(
                    "status {}: {}",
                    reply.status,
                    truncated_body(&reply.body)
                ),
            });
        }

        let envelope: Envelope = serde_json::from_slice(&reply.body).map_err(|err| {
            counter!("tagsweep_upstream_fetch_total", "outcome" => "invalid_body").increment(1);
            FetchError::UpstreamFetch {
                status: Some(reply.status.as_u16()),
                message: format!("response body is not a query envelope: {err}"),
            }
        })?;

        if let Some(errors) = envelope.errors.filter(has_errors) {
            counter!("tagsweep_upstream_fetch_total", "outcome" => "query_error").increment(1);
            return Err(FetchError::UpstreamQuery { errors });
        }

        counter!("tagsweep_upstream_fetch_total", "outcome" => "ok").increment(1);

        let cache_tags = parse_cache_tags_header(reply.cache_tags.as_deref());
        debug!(
            target = "tagsweep::content",
            query_id = %query_id,
            tag_count = cache_tags.len(),
            "fetched tagged query result"
        );

        let tracked = self.record_dependencies(&query_id, &cache_tags).await;

        Ok(TaggedResult {
            query_id,
            data: envelope.data.unwrap_or(Value::Null),
            cache_tags,
            tracked,
        })
    }

    async fn record_dependencies(&self, query_id: &QueryId, tags: &BTreeSet<CacheTag>) -> bool {
        let mut tracked = true;
        if let Err(err) = self.associations.upsert_associations(query_id, tags).await {
            counter!("tagsweep_associations_upsert_failed_total").increment(1);
            warn!(
                target = "tagsweep::content",
                query_id = %query_id,
                tag_count = tags.len(),
                error = %err,
                "failed to record cache tag associations"
            );
            tracked = false;
        }

        let Some(limit) = self.cache.tag_limit() else {
            return tracked;
        };

        let tags: Vec<CacheTag> = tags.iter().cloned().collect();
        for chunk in tags.chunks(limit.get()) {
            if let Err(err) = self.cache.attach_tags(query_id, chunk).await {
                warn!(
                    target = "tagsweep::content",
                    query_id = %query_id,
                    chunk_len = chunk.len(),
                    error = %err,
                    "failed to attach cache tags downstream"
                );
                tracked = false;
            }
        }
        tracked
    }
}

fn has_errors(errors: &Value) -> bool {
    match errors {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

fn truncated_body(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(MAX_ERROR_BODY_CHARS)
        .collect()
}
