//! Downstream cache adapters.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use axum::http::{HeaderValue, header};
use lru::LruCache;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::application::downstream::{CachedEntry, DownstreamCache, DownstreamError};
use crate::config::DownstreamSettings;
use crate::domain::{CacheTag, QueryId};
use crate::infra::error::InfraError;

#[derive(Serialize)]
#[serde(untagged)]
enum RevalidateBody<'a> {
    Keys { keys: [&'a str; 1] },
    All { all: bool },
}

/// Forwards invalidations to a revalidation endpoint of the rendering tier.
pub struct HttpRevalidator {
    client: Client,
    url: Url,
    authorization: Option<HeaderValue>,
}

impl HttpRevalidator {
    pub fn new(url: Url, settings: &DownstreamSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("tagsweep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(InfraError::http_client)?;

        let authorization = settings
            .token
            .as_deref()
            .map(|token| {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(
                    |err| InfraError::configuration(format!("downstream.token: {err}")),
                )?;
                value.set_sensitive(true);
                Ok::<_, InfraError>(value)
            })
            .transpose()?;

        Ok(Self {
            client,
            url,
            authorization,
        })
    }

    async fn post(&self, body: &RevalidateBody<'_>) -> Result<(), DownstreamError> {
        let mut request = self.client.post(self.url.clone()).json(body);
        if let Some(auth) = self.authorization.as_ref() {
            request = request.header(header::AUTHORIZATION, auth.clone());
        }

        let response = request.send().await.map_err(DownstreamError::transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DownstreamError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl DownstreamCache for HttpRevalidator {
    async fn invalidate(&self, key: &QueryId) -> Result<(), DownstreamError> {
        self.post(&RevalidateBody::Keys {
            keys: [key.as_str()],
        })
        .await
    }

    async fn invalidate_all(&self) -> Result<(), DownstreamError> {
        self.post(&RevalidateBody::All { all: true }).await
    }
}

#[derive(Debug)]
struct Entry {
    data: Option<Value>,
    tags: BTreeSet<CacheTag>,
    /// Clock value of the last invalidation that reached this key.
    invalidated_at: u64,
}

impl Entry {
    fn empty(invalidated_at: u64) -> Self {
        Self {
            data: None,
            tags: BTreeSet::new(),
            invalidated_at,
        }
    }
}

struct State {
    entries: LruCache<QueryId, Entry>,
    /// Bumped on every invalidation.
    clock: u64,
    /// Highest `invalidated_at` among entries no longer held.
    floor: u64,
}

impl State {
    fn insert(&mut self, key: QueryId, entry: Entry) {
        if let Some((evicted_key, evicted)) = self.entries.push(key.clone(), entry)
            && evicted_key != key
        {
            self.floor = self.floor.max(evicted.invalidated_at);
        }
    }
}

/// In-process result cache used when no revalidation endpoint is configured.
///
/// Holds at most `capacity` keys with LRU eviction. Invalidating a key leaves
/// an empty entry stamped with the invalidation clock, so a payload fetched
/// before the invalidation is refused by `store`.
pub struct MemoryCache {
    state: Mutex<State>,
    tag_limit: NonZeroUsize,
}

impl MemoryCache {
    pub fn new(tag_limit: NonZeroUsize, capacity: NonZeroUsize) -> Self {
        Self {
            state: Mutex::new(State {
                entries: LruCache::new(capacity),
                clock: 0,
                floor: 0,
            }),
            tag_limit,
        }
    }

    pub async fn contains(&self, key: &QueryId) -> bool {
        self.state
            .lock()
            .await
            .entries
            .peek(key)
            .is_some_and(|entry| entry.data.is_some())
    }

    pub async fn tags_of(&self, key: &QueryId) -> BTreeSet<CacheTag> {
        self.state
            .lock()
            .await
            .entries
            .peek(key)
            .map(|entry| entry.tags.clone())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DownstreamCache for MemoryCache {
    async fn invalidate(&self, key: &QueryId) -> Result<(), DownstreamError> {
        let mut state = self.state.lock().await;
        state.clock += 1;
        let clock = state.clock;
        match state.entries.get_mut(key) {
            Some(entry) => {
                if entry.data.is_some() {
                    debug!(target = "tagsweep::downstream", query_id = %key, "evicted cached query");
                }
                *entry = Entry::empty(clock);
            }
            None => state.insert(key.clone(), Entry::empty(clock)),
        }
        Ok(())
    }

    async fn invalidate_all(&self) -> Result<(), DownstreamError> {
        let mut state = self.state.lock().await;
        state.clock += 1;
        state.floor = state.clock;
        state.entries.clear();
        Ok(())
    }

    fn tag_limit(&self) -> Option<NonZeroUsize> {
        Some(self.tag_limit)
    }

    async fn attach_tags(&self, key: &QueryId, tags: &[CacheTag]) -> Result<(), DownstreamError> {
        if tags.len() > self.tag_limit.get() {
            return Err(DownstreamError::TagLimitExceeded {
                limit: self.tag_limit.get(),
                given: tags.len(),
            });
        }
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(key) {
            entry.tags.extend(tags.iter().cloned());
            return Ok(());
        }
        let mut entry = Entry::empty(state.floor);
        entry.tags.extend(tags.iter().cloned());
        state.insert(key.clone(), entry);
        Ok(())
    }

    async fn lookup(&self, key: &QueryId) -> Option<CachedEntry> {
        let mut state = self.state.lock().await;
        let entry = state.entries.get(key)?;
        if entry.tags.is_empty() {
            return None;
        }
        entry.data.as_ref().map(|data| CachedEntry {
            data: data.clone(),
            cache_tags: entry.tags.clone(),
        })
    }

    async fn generation(&self, _key: &QueryId) -> u64 {
        self.state.lock().await.clock
    }

    async fn store(&self, key: &QueryId, data: &Value, generation: u64) {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(key) {
            Some(entry) if entry.invalidated_at <= generation && !entry.tags.is_empty() => {
                entry.data = Some(data.clone());
            }
            _ => debug!(
                target = "tagsweep::downstream",
                query_id = %key,
                "discarded payload invalidated during fetch"
            ),
        }
    }
}
