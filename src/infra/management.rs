//! Content management API client used to register the invalidation webhook.

use axum::http::{HeaderValue, header};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::ManagementSettings;
use crate::infra::error::InfraError;

const API_VERSION_HEADER: &str = "x-api-version";
const WEBHOOK_NAME: &str = "Invalidate cached queries using cache tags";
const INVALIDATION_PATH: [&str; 2] = ["api", "invalidate-cache-tags"];

#[derive(Deserialize)]
struct Created {
    data: CreatedData,
}

#[derive(Deserialize)]
struct CreatedData {
    id: String,
}

pub struct WebhookRegistrar {
    client: Client,
    endpoint: Url,
    authorization: HeaderValue,
}

impl WebhookRegistrar {
    pub fn new(settings: &ManagementSettings) -> Result<Self, InfraError> {
        let token = settings.api_token.as_deref().ok_or_else(|| {
            InfraError::configuration("management.api_token is required to register the webhook")
        })?;
        let mut authorization = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| InfraError::configuration(format!("management.api_token: {err}")))?;
        authorization.set_sensitive(true);

        let client = Client::builder()
            .user_agent(concat!("tagsweep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(InfraError::http_client)?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            authorization,
        })
    }

    /// Create a webhook that delivers `cda_cache_tags` invalidation events to
    /// `public_url`, authenticated with `webhook_token`. Returns the webhook id.
    pub async fn register(&self, public_url: &Url, webhook_token: &str) -> Result<String, InfraError> {
        let target = invalidation_url(public_url)?;
        let url = self
            .endpoint
            .join("webhooks")
            .map_err(|err| InfraError::configuration(format!("management.endpoint: {err}")))?;

        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, self.authorization.clone())
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/vnd.api+json")
            .header(API_VERSION_HEADER, "3")
            .json(&webhook_body(&target, webhook_token))
            .send()
            .await
            .map_err(InfraError::http_client)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InfraError::Registration {
                status: status.as_u16(),
                body,
            });
        }

        let created: Created = response.json().await.map_err(InfraError::http_client)?;
        Ok(created.data.id)
    }
}

fn invalidation_url(public_url: &Url) -> Result<Url, InfraError> {
    let mut target = public_url.clone();
    target
        .path_segments_mut()
        .map_err(|_| InfraError::configuration("management.public_url cannot be a base URL"))?
        .pop_if_empty()
        .extend(INVALIDATION_PATH);
    Ok(target)
}

fn webhook_body(target: &Url, webhook_token: &str) -> Value {
    json!({
        "data": {
            "type": "webhook",
            "attributes": {
                "name": WEBHOOK_NAME,
                "url": target.as_str(),
                "custom_payload": null,
                "headers": { "Webhook-Token": webhook_token },
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
    })
}
