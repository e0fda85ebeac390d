//! Deterministic query identifiers.
//!
//! A query identifier is the SHA-256 digest of the query text followed by a
//! canonical JSON rendering of its variables. Object keys are sorted at every
//! depth before hashing, so two variable sets that differ only in key
//! insertion order map to the same identifier. Integral floats such as `1.0`
//! render like the integer `1`.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::QueryId;

/// Largest magnitude below which every integral `f64` is an exact integer.
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },
}

impl FingerprintError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }
}

/// Derive the identifier for `query` executed with `variables`.
///
/// The query text must already be in its printed, canonical form. `null`
/// variables hash the same as no variables at all.
pub fn fingerprint<V>(query: &str, variables: &V) -> Result<QueryId, FingerprintError>
where
    V: Serialize + ?Sized,
{
    if query.trim().is_empty() {
        return Err(FingerprintError::invalid("query text is empty"));
    }

    let variables = serde_json::to_value(variables)
        .map_err(|err| FingerprintError::invalid(format!("variables are not serializable: {err}")))?;

    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    // Separates the query text from the variables so the boundary is unambiguous.
    hasher.update([0u8]);
    hasher.update(canonical_variables(&variables).as_bytes());

    Ok(QueryId::from_digest(hex::encode(hasher.finalize())))
}

/// Canonical JSON for a variables value; `null` renders as the empty string.
pub fn canonical_variables(variables: &Value) -> String {
    let mut out = String::new();
    if !variables.is_null() {
        write_canonical(variables, &mut out);
    }
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(text) => write_string(text, out),
        Value::Number(number) => write_number(number, out),
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn write_number(number: &Number, out: &mut String) {
    if number.is_f64()
        && let Some(float) = number.as_f64()
        && float.fract() == 0.0
        && float.abs() < MAX_EXACT_FLOAT_INT
    {
        let _ = write!(out, "{}", float as i64);
        return;
    }
    let _ = write!(out, "{number}");
}

fn write_string(text: &str, out: &mut String) {
    let _ = write!(out, "{}", Value::String(text.to_string()));
}
