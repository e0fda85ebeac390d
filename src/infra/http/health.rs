use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};

use super::HttpState;
use super::error::{ApiError, codes};

pub async fn healthz(State(state): State<HttpState>) -> Result<Json<Value>, ApiError> {
    match state.associations.health_check().await {
        Ok(()) => Ok(Json(json!({ "status": "ok" }))),
        Err(err) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::STORE_UNAVAILABLE,
            "Association store unavailable",
            Some(err.to_string()),
        )),
    }
}
