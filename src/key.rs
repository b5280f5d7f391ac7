//! Request key normalization
//!
//! A request descriptor is anything `serde` can serialize. Descriptors that
//! are structurally equal normalize to the same [`CacheKey`], which is what
//! lets the store and the fetch coordinator share entries and in-flight
//! fetches between independent callers.
//!
//! - `None`, `()`, `""` and empty sequences mean "no request"
//! - strings are used verbatim
//! - sequences encode as `@` + `elem,`... and maps as `#` + `name:elem,`...
//!   with names sorted

use std::{borrow::Borrow, fmt};

use serde::Serialize;
use serde_json::Value;

use crate::CacheError;

/// Normalized identity of a cached request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a request descriptor into a cache key.
///
/// Returns `Ok(None)` when the descriptor means "no request", so callers can
/// skip fetching entirely. A descriptor that cannot be serialized is reported
/// as [`CacheError::InvalidKey`].
pub fn normalize<D>(descriptor: &D) -> Result<Option<CacheKey>, CacheError>
where
    D: Serialize + ?Sized,
{
    let value =
        serde_json::to_value(descriptor).map_err(|e| CacheError::InvalidKey(e.to_string()))?;

    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(CacheKey(s))),
        Value::Array(items) if items.is_empty() => Ok(None),
        other => {
            let mut encoded = String::new();
            encode(&other, &mut encoded);
            Ok(Some(CacheKey(encoded)))
        }
    }
}

fn encode(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        // JSON quoting keeps "a,b" distinct from the two elements "a" and "b"
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('@');
            for item in items {
                encode(item, out);
                out.push(',');
            }
        }
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));

            out.push('#');
            for (name, item) in fields {
                out.push_str(name);
                out.push(':');
                encode(item, out);
                out.push(',');
            }
        }
    }
}
