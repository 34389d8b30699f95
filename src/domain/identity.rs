//! Event identity computation.
//!
//! An event stream is identified by a composite key derived from its
//! `(category, id)` pair. The payload carried by an event is fingerprinted
//! separately so that a semantic change in the payload can reset the stream.
//!
//! Both digests are SHA-256, hex-encoded, so they are stable across
//! processes and safe to use as keys in a shared backing store.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Error returned when event identifiers fail validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// `category` must be a non-empty string
    EmptyCategory,
    /// `id` must be a non-empty string
    EmptyId,
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::EmptyCategory => write!(f, "event category must be a non-empty string"),
            IdentityError::EmptyId => write!(f, "event id must be a non-empty string"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Compute the composite key identifying one event stream.
///
/// The key is `SHA-256(category ":" id)`, hex-encoded (64 characters).
///
/// # Errors
/// Returns `IdentityError` if either identifier is empty.
pub fn composite_key(category: &str, id: &str) -> Result<String, IdentityError> {
    if category.is_empty() {
        return Err(IdentityError::EmptyCategory);
    }
    if id.is_empty() {
        return Err(IdentityError::EmptyId);
    }

    let mut hasher = Sha256::new();
    hasher.update(category.as_bytes());
    hasher.update(b":");
    hasher.update(id.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the fingerprint of an event's details payload.
///
/// The payload is serialized canonically (object keys sorted
/// lexicographically, which `serde_json`'s default map representation
/// guarantees) and hashed with SHA-256. A missing payload (`Value::Null`)
/// produces the empty string, as does a serialization failure; fingerprinting
/// never surfaces an error to the caller.
pub fn details_hash(details: &Value) -> String {
    if details.is_null() {
        return String::new();
    }

    match serde_json::to_string(&canonicalize(details)) {
        Ok(canonical) => {
            let mut hasher = Sha256::new();
            hasher.update(canonical.as_bytes());
            hex::encode(hasher.finalize())
        }
        Err(_) => String::new(),
    }
}

/// Rebuild a JSON value with object keys in sorted order at every level.
///
/// Array order is preserved; it is part of the payload's meaning.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
