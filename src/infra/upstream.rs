//! HTTP transport to the headless content API.

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue, header};
use reqwest::{Client, Url};

use crate::application::content::{ContentTransport, QueryRequest, TransportError, UpstreamReply};
use crate::config::UpstreamSettings;
use crate::infra::error::InfraError;

const EXCLUDE_INVALID_HEADER: &str = "x-exclude-invalid";
const REQUEST_CACHE_TAGS_HEADER: &str = "x-cache-tags";

pub struct HttpContentTransport {
    client: Client,
    endpoint: Url,
    authorization: Option<HeaderValue>,
    tag_header: HeaderName,
}

impl HttpContentTransport {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("tagsweep/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .build()
            .map_err(InfraError::http_client)?;

        let authorization = settings
            .api_token
            .as_deref()
            .map(|token| {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| InfraError::configuration(format!("upstream.api_token: {err}")))?;
                value.set_sensitive(true);
                Ok::<_, InfraError>(value)
            })
            .transpose()?;

        let tag_header = HeaderName::from_bytes(settings.tag_header.as_bytes())
            .map_err(|err| InfraError::configuration(format!("upstream.tag_header: {err}")))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            authorization,
            tag_header,
        })
    }
}

#[async_trait]
impl ContentTransport for HttpContentTransport {
    async fn execute(&self, request: &QueryRequest<'_>) -> Result<UpstreamReply, TransportError> {
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(header::ACCEPT, "application/json")
            .header(EXCLUDE_INVALID_HEADER, "true")
            .header(REQUEST_CACHE_TAGS_HEADER, "true")
            .json(request);
        if let Some(auth) = self.authorization.as_ref() {
            builder = builder.header(header::AUTHORIZATION, auth.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError(err.to_string()))?;

        let status = response.status();
        let cache_tags = response
            .headers()
            .get(&self.tag_header)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError(err.to_string()))?;

        Ok(UpstreamReply {
            status,
            cache_tags,
            body,
        })
    }
}
