use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{Value, json};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tagsweep::application::content::{ContentClient, ContentTransport, FetchError, QueryRequest};
use tagsweep::application::downstream::{DownstreamCache, DownstreamError};
use tagsweep::application::fingerprint::fingerprint;
use tagsweep::config::{DownstreamSettings, ManagementSettings, UpstreamSettings};
use tagsweep::infra::downstream::{HttpRevalidator, MemoryCache};
use tagsweep::infra::error::InfraError;
use tagsweep::infra::management::WebhookRegistrar;
use tagsweep::infra::memory::MemoryAssociations;
use tagsweep::infra::upstream::HttpContentTransport;

fn upstream_settings(server: &MockServer) -> UpstreamSettings {
    UpstreamSettings {
        endpoint: format!("{}/graphql", server.uri()).parse().unwrap(),
        api_token: Some("read-token".to_string()),
        tag_header: "x-cache-tags".to_string(),
        timeout: Duration::from_secs(5),
    }
}

fn downstream_settings(token: Option<&str>) -> DownstreamSettings {
    DownstreamSettings {
        revalidate_url: None,
        token: token.map(str::to_string),
        tag_limit: NonZeroUsize::new(64).unwrap(),
        memory_capacity: NonZeroUsize::new(1024).unwrap(),
    }
}

#[tokio::test]
async fn transport_sends_tag_flags_and_reads_the_tag_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer read-token"))
        .and(header("x-exclude-invalid", "true"))
        .and(header("x-cache-tags", "true"))
        .and(body_json(json!({"query": "query Q1", "variables": {"slug": "hello"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-cache-tags", "post-1 author-5")
                .set_body_json(json!({"data": {"post": {"id": "1"}}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpContentTransport::new(&upstream_settings(&server)).unwrap();
    let variables = json!({"slug": "hello"});
    let reply = transport
        .execute(&QueryRequest {
            query: "query Q1",
            variables: &variables,
        })
        .await
        .unwrap();

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.cache_tags.as_deref(), Some("post-1 author-5"));
}

#[tokio::test]
async fn client_attaches_tags_to_a_tag_aware_cache_in_chunks() {
    let server = MockServer::start().await;
    let header_value = (0..130)
        .map(|i| format!("tag-{i:03}"))
        .collect::<Vec<_>>()
        .join(",");
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-cache-tags", header_value.as_str())
                .set_body_json(json!({"data": {}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryAssociations::new());
    let cache = Arc::new(MemoryCache::new(
        NonZeroUsize::new(64).unwrap(),
        NonZeroUsize::new(1024).unwrap(),
    ));
    let client = ContentClient::new(
        Arc::new(HttpContentTransport::new(&upstream_settings(&server)).unwrap()),
        store.clone(),
        cache.clone(),
    );

    let result = client
        .fetch_with_tags("query Q1", &Value::Null)
        .await
        .unwrap();

    assert_eq!(result.cache_tags.len(), 130);
    assert_eq!(cache.tags_of(&result.query_id).await.len(), 130);
    assert_eq!(store.len().await, 130);
}

#[tokio::test]
async fn upstream_error_status_is_an_upstream_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryAssociations::new());
    let client = ContentClient::new(
        Arc::new(HttpContentTransport::new(&upstream_settings(&server)).unwrap()),
        store.clone(),
        Arc::new(MemoryCache::new(
            NonZeroUsize::new(64).unwrap(),
            NonZeroUsize::new(1024).unwrap(),
        )),
    );

    let err = client
        .fetch_with_tags("query Q1", &Value::Null)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FetchError::UpstreamFetch {
            status: Some(401),
            ..
        }
    ));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn revalidator_posts_keys_with_bearer_token() {
    let server = MockServer::start().await;
    let key = fingerprint("query Q1", &Value::Null).unwrap();

    Mock::given(method("POST"))
        .and(path("/revalidate"))
        .and(header("authorization", "Bearer purge-token"))
        .and(body_json(json!({"keys": [key.as_str()]})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/revalidate"))
        .and(body_json(json!({"all": true})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let revalidator = HttpRevalidator::new(
        format!("{}/revalidate", server.uri()).parse().unwrap(),
        &downstream_settings(Some("purge-token")),
    )
    .unwrap();

    revalidator.invalidate(&key).await.unwrap();
    revalidator.invalidate_all().await.unwrap();
}

#[tokio::test]
async fn revalidator_surfaces_error_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let revalidator = HttpRevalidator::new(
        format!("{}/revalidate", server.uri()).parse().unwrap(),
        &downstream_settings(None),
    )
    .unwrap();

    let err = revalidator
        .invalidate(&fingerprint("query Q1", &Value::Null).unwrap())
        .await
        .unwrap_err();

    match err {
        DownstreamError::Status { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "overloaded");
        }
        other => panic!("unexpected error: {other}"),
    }
}

fn management_settings(server: &MockServer) -> ManagementSettings {
    ManagementSettings {
        endpoint: format!("{}/", server.uri()).parse().unwrap(),
        api_token: Some("cma-token".to_string()),
        public_url: Some("https://blog.example.com".parse().unwrap()),
    }
}

#[tokio::test]
async fn registrar_creates_the_cache_tag_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhooks"))
        .and(header("authorization", "Bearer cma-token"))
        .and(header("x-api-version", "3"))
        .and(header("content-type", "application/vnd.api+json"))
        .and(body_json(json!({
            "data": {
                "type": "webhook",
                "attributes": {
                    "name": "Invalidate cached queries using cache tags",
                    "url": "https://blog.example.com/api/invalidate-cache-tags",
                    "custom_payload": null,
                    "headers": { "Webhook-Token": "s3cret" },
                    "events": [{
                        "entity_type": "cda_cache_tags",
                        "event_types": ["invalidate"],
                        "filters": []
                    }],
                    "http_basic_user": null,
                    "http_basic_password": null,
                    "enabled": true,
                    "payload_api_version": "3",
                    "nested_items_in_payload": false
                }
            }
        })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"data": {"id": "42", "type": "webhook"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let settings = management_settings(&server);
    let registrar = WebhookRegistrar::new(&settings).unwrap();

    let id = registrar
        .register(settings.public_url.as_ref().unwrap(), "s3cret")
        .await
        .unwrap();
    assert_eq!(id, "42");
}

#[tokio::test]
async fn registrar_surfaces_rejections() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhooks"))
        .respond_with(ResponseTemplate::new(422).set_body_string("INVALID_FIELD"))
        .mount(&server)
        .await;

    let settings = management_settings(&server);
    let registrar = WebhookRegistrar::new(&settings).unwrap();

    let err = registrar
        .register(settings.public_url.as_ref().unwrap(), "s3cret")
        .await
        .unwrap_err();

    match err {
        InfraError::Registration { status, body } => {
            assert_eq!(status, 422);
            assert_eq!(body, "INVALID_FIELD");
        }
        other => panic!("unexpected error: {other}"),
    }
}
