use std::error::Error as StdError;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::content::FetchError;
use crate::application::error::ErrorReport;
use crate::application::invalidation::InvalidationError;

const SOURCE: &str = "infra::http";

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const INVALID_QUERY: &str = "invalid_query";
    pub const UPSTREAM_FETCH: &str = "upstream_fetch_error";
    pub const UPSTREAM_QUERY: &str = "upstream_query_error";
    pub const DOWNSTREAM: &str = "downstream_error";
    pub const STORE_UNAVAILABLE: &str = "store_unavailable";
    pub const INTERNAL: &str = "internal_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    report: Option<ErrorReport>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            report: None,
        }
    }

    /// Keep the full error chain for the response log without exposing it in the body.
    fn with_source(mut self, source: &'static str, error: &dyn StdError) -> Self {
        self.report = Some(ErrorReport::from_error(source, self.status, error));
        self
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHORIZED,
            "You need to provide a secret token in the `Webhook-Token` header for this endpoint.",
            None,
        )
    }

    pub fn internal(source: &'static str, error: &dyn StdError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::INTERNAL,
            "Internal server error",
            None,
        )
        .with_source(source, error)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let report = self.report.unwrap_or_else(|| {
            ErrorReport::from_message(
                SOURCE,
                self.status,
                format!(
                    "{}: {}",
                    self.code,
                    self.hint.as_deref().unwrap_or(self.message)
                ),
            )
        });
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("Request body is malformed", Some(rejection.body_text()))
    }
}

impl From<InvalidationError> for ApiError {
    fn from(err: InvalidationError) -> Self {
        let api = match &err {
            InvalidationError::Resolve(_)
            | InvalidationError::Prune(_)
            | InvalidationError::Truncate(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::STORE_UNAVAILABLE,
                "Association store unavailable; retry the event",
                None,
            ),
            InvalidationError::Downstream { failed, .. } => Self::new(
                StatusCode::BAD_GATEWAY,
                codes::DOWNSTREAM,
                "Downstream cache invalidation failed; retry the event",
                (!failed.is_empty()).then(|| format!("{} identifier(s) not invalidated", failed.len())),
            ),
        };
        api.with_source("infra::http::webhook", &err)
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let api = match &err {
            FetchError::InvalidQuery(inner) => Self::new(
                StatusCode::BAD_REQUEST,
                codes::INVALID_QUERY,
                "Query could not be fingerprinted",
                Some(inner.to_string()),
            ),
            FetchError::UpstreamFetch { .. } => Self::new(
                StatusCode::BAD_GATEWAY,
                codes::UPSTREAM_FETCH,
                "Content source request failed",
                None,
            ),
            FetchError::UpstreamQuery { errors } => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                codes::UPSTREAM_QUERY,
                "Content source rejected the query",
                Some(errors.to_string()),
            ),
        };
        api.with_source("infra::http::queries", &err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::downstream::DownstreamError;
    use crate::application::repos::RepoError;

    #[test]
    fn store_failures_are_retryable_server_errors() {
        let err: ApiError = InvalidationError::Prune(RepoError::Timeout).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err: ApiError = InvalidationError::Downstream {
            failed: Vec::new(),
            source: DownstreamError::transport("refused"),
        }
        .into();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn fetch_errors_map_to_distinct_statuses() {
        let err: ApiError = FetchError::UpstreamQuery {
            errors: serde_json::json!([{"message": "boom"}]),
        }
        .into();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let err: ApiError = FetchError::UpstreamFetch {
            status: Some(500),
            message: "status 500".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
