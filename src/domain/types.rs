//! Opaque identifiers exchanged with the content source and the downstream cache.
//!
//! `QueryId` and `CacheTag` are both strings on the wire and in the database,
//! but they name different things: a query identifier is a content-addressed
//! key we derive ourselves, a cache tag is a token issued by the content
//! source. Keeping them as distinct types stops one from being passed where
//! the other is expected.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Length of a hex-encoded SHA-256 digest.
pub const QUERY_ID_LEN: usize = 64;

/// Deterministic identifier of a (query text, variables) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueryId(String);

impl QueryId {
    /// Validate an identifier read back from storage or from the wire.
    pub fn parse(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        let well_formed = raw.len() == QUERY_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if !well_formed {
            return Err(DomainError::validation(format!(
                "`{raw}` is not a {QUERY_ID_LEN}-character lowercase hex digest"
            )));
        }

        Ok(Self(raw))
    }

    pub(crate) fn from_digest(hex_digest: String) -> Self {
        Self(hex_digest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for QueryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for QueryId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<QueryId> for String {
    fn from(value: QueryId) -> Self {
        value.0
    }
}

/// Token issued by the content source naming an entity or collection.
///
/// Tags are compared for equality only. They never contain whitespace or
/// commas because the response header that carries them is split on both.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheTag(String);

impl CacheTag {
    pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DomainError::validation("cache tag must not be empty"));
        }
        if raw.chars().any(is_tag_separator) {
            return Err(DomainError::validation(format!(
                "cache tag `{raw}` contains a separator character"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CacheTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CacheTag {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CacheTag> for String {
    fn from(value: CacheTag) -> Self {
        value.0
    }
}

fn is_tag_separator(c: char) -> bool {
    c.is_whitespace() || c == ','
}

/// Parse the cache tag response header into a set of tags.
///
/// Deployments differ on the separator (space or comma), so both are
/// accepted. A missing or blank header yields an empty set.
pub fn parse_cache_tags_header(header: Option<&str>) -> BTreeSet<CacheTag> {
    let Some(header) = header else {
        return BTreeSet::new();
    };

    header
        .split(is_tag_separator)
        .filter(|token| !token.is_empty())
        .map(|token| CacheTag(token.to_string()))
        .collect()
}
