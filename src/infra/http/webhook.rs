//! Invalidation webhooks sent by the content source.

use std::collections::BTreeSet;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{CacheTag, QueryId};

use super::HttpState;
use super::error::ApiError;

/// Event body; only `entity.attributes.tags` is read.
#[derive(Debug, Deserialize)]
pub struct InvalidationEvent {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    pub entity: EventEntity,
}

#[derive(Debug, Deserialize)]
pub struct EventEntity {
    pub attributes: EventAttributes,
}

#[derive(Debug, Deserialize)]
pub struct EventAttributes {
    pub tags: Vec<CacheTag>,
}

#[derive(Debug, Serialize)]
pub struct InvalidationResponse {
    pub tags: BTreeSet<CacheTag>,
    pub identifiers: BTreeSet<QueryId>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub removed: u64,
}

fn malformed(rejection: JsonRejection) -> ApiError {
    counter!("tagsweep_webhook_rejected_total", "reason" => "malformed").increment(1);
    ApiError::from(rejection)
}

pub async fn invalidate_cache_tags(
    State(state): State<HttpState>,
    payload: Result<Json<InvalidationEvent>, JsonRejection>,
) -> Result<Json<InvalidationResponse>, ApiError> {
    let Json(event) = payload.map_err(malformed)?;
    let tags: BTreeSet<CacheTag> = event.entity.attributes.tags.into_iter().collect();

    info!(
        target = "tagsweep::http::webhook",
        entity_type = event.entity_type.as_deref().unwrap_or(""),
        event_type = event.event_type.as_deref().unwrap_or(""),
        tag_count = tags.len(),
        "received invalidation event"
    );

    // Detached so a dropped connection cannot cancel the batch halfway.
    let service = state.invalidation.clone();
    let identifiers = tokio::spawn(async move {
        service
            .process_invalidation(&tags)
            .await
            .map(|identifiers| (tags, identifiers))
    })
    .await
    .map_err(|err| ApiError::internal("infra::http::webhook", &err))?;

    let (tags, identifiers) = identifiers?;
    Ok(Json(InvalidationResponse { tags, identifiers }))
}

pub async fn invalidate_all(
    State(state): State<HttpState>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let service = state.invalidation.clone();
    let removed = tokio::spawn(async move { service.purge_all().await })
        .await
        .map_err(|err| ApiError::internal("infra::http::webhook", &err))??;

    Ok(Json(PurgeResponse { removed }))
}
