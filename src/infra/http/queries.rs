//! Query proxy for the rendering tier.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use serde::Deserialize;
use serde_json::Value;

use crate::application::content::TaggedResult;

use super::HttpState;
use super::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct QueryBatch {
    pub queries: Vec<QueryItem>,
}

#[derive(Debug, Deserialize)]
pub struct QueryItem {
    pub query: String,
    #[serde(default)]
    pub variables: Value,
}

/// Run a batch of queries inside one request scope, answering in input order.
pub async fn execute_queries(
    State(state): State<HttpState>,
    payload: Result<Json<QueryBatch>, JsonRejection>,
) -> Result<Json<Vec<TaggedResult>>, ApiError> {
    let Json(batch) = payload?;

    let scope = state.queries.scope();
    let mut results = Vec::with_capacity(batch.queries.len());
    for item in &batch.queries {
        results.push(scope.execute(&item.query, &item.variables).await?);
    }

    Ok(Json(results))
}
