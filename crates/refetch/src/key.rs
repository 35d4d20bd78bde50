// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured query keys and their canonical hashes.
//!
//! A [`QueryKey`] is a JSON array supplied by the caller, for example
//! `["todos", {"status": "done", "page": 1}]`. Two keys identify the same cache
//! entry exactly when their canonical serializations are equal. Canonicalization
//! sorts object properties recursively, so property insertion order never matters,
//! while array order and value types always do.

use std::{
    fmt::{self, Write},
    sync::Arc,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::KeyError;

/// The canonical serialization of a [`QueryKey`].
///
/// This is the lookup key of the [`QueryCache`](crate::QueryCache). Equality of two
/// hashes is equivalent to semantic equality of the keys they were computed from.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyHash(Arc<str>);

impl KeyHash {
    /// Returns the canonical serialization as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A structured identifier for a query.
///
/// Keys are ordered JSON arrays that may mix strings, numbers, booleans, nested arrays
/// and plain objects. The hash is computed once at construction time.
///
/// # Examples
///
/// ```
/// use refetch::QueryKey;
/// use serde_json::json;
///
/// let a = QueryKey::new(json!(["todos", {"status": "done", "page": 1}]))?;
/// let b = QueryKey::new(json!(["todos", {"page": 1, "status": "done"}]))?;
/// assert_eq!(a.hash(), b.hash());
///
/// let c = QueryKey::new(json!(["todos", 1]))?;
/// let d = QueryKey::new(json!(["todos", "1"]))?;
/// assert_ne!(c.hash(), d.hash());
/// # Ok::<(), refetch::KeyError>(())
/// ```
#[derive(Clone)]
pub struct QueryKey {
    value: Arc<Value>,
    hash: KeyHash,
}

impl QueryKey {
    /// Creates a key from any serializable value.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Serialize`] if the value cannot be represented as JSON and
    /// [`KeyError::NotAnArray`] if the top-level value is not an array.
    pub fn new(key: impl Serialize) -> Result<Self, KeyError> {
        let value = serde_json::to_value(key).map_err(|e| KeyError::Serialize(e.to_string()))?;
        Self::from_value(value)
    }

    /// Creates a key from an already-built JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotAnArray`] if the value is not a JSON array.
    pub fn from_value(value: Value) -> Result<Self, KeyError> {
        if !value.is_array() {
            return Err(KeyError::NotAnArray(kind_of(&value)));
        }

        let hash = KeyHash(canonicalize(&value).into());
        Ok(Self {
            value: Arc::new(value),
            hash,
        })
    }

    /// Returns the canonical hash of this key.
    #[must_use]
    pub fn hash(&self) -> &KeyHash {
        &self.hash
    }

    /// Returns the key as it was supplied.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Returns the elements of the key.
    #[must_use]
    pub fn segments(&self) -> &[Value] {
        self.value.as_array().map_or(&[], Vec::as_slice)
    }

    /// Returns `true` if `prefix` partially matches this key.
    ///
    /// Arrays match element-wise as a prefix and objects match when every property of
    /// the filter object matches the corresponding property of this key. Scalars must
    /// be equal. An empty filter matches every key.
    ///
    /// # Examples
    ///
    /// ```
    /// use refetch::QueryKey;
    /// use serde_json::json;
    ///
    /// let key = QueryKey::new(json!(["todos", {"status": "done", "page": 1}]))?;
    /// assert!(key.matches_prefix(&QueryKey::new(json!(["todos"]))?));
    /// assert!(key.matches_prefix(&QueryKey::new(json!(["todos", {"page": 1}]))?));
    /// assert!(!key.matches_prefix(&QueryKey::new(json!(["todo"]))?));
    /// # Ok::<(), refetch::KeyError>(())
    /// ```
    #[must_use]
    pub fn matches_prefix(&self, prefix: &Self) -> bool {
        partial_match(&self.value, &prefix.value)
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for QueryKey {}

impl std::hash::Hash for QueryKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.hash)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.hash, f)
    }
}

impl TryFrom<Value> for QueryKey {
    type Error = KeyError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

/// Conversion into a [`QueryKey`], accepted by every operation that takes a key.
///
/// Implemented for keys themselves, JSON values, and arrays, slices and vectors of
/// serializable elements. Use [`serde_json::json!`] for keys that mix element types.
pub trait IntoQueryKey {
    /// Performs the conversion.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the value is not a valid key.
    fn into_query_key(self) -> Result<QueryKey, KeyError>;
}

impl IntoQueryKey for QueryKey {
    fn into_query_key(self) -> Result<QueryKey, KeyError> {
        Ok(self)
    }
}

impl IntoQueryKey for &QueryKey {
    fn into_query_key(self) -> Result<QueryKey, KeyError> {
        Ok(self.clone())
    }
}

impl IntoQueryKey for Value {
    fn into_query_key(self) -> Result<QueryKey, KeyError> {
        QueryKey::from_value(self)
    }
}

impl<S: Serialize, const N: usize> IntoQueryKey for [S; N] {
    fn into_query_key(self) -> Result<QueryKey, KeyError> {
        QueryKey::new(&self[..])
    }
}

impl<S: Serialize> IntoQueryKey for &[S] {
    fn into_query_key(self) -> Result<QueryKey, KeyError> {
        QueryKey::new(self)
    }
}

impl<S: Serialize> IntoQueryKey for Vec<S> {
    fn into_query_key(self) -> Result<QueryKey, KeyError> {
        QueryKey::new(self)
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Serializes `value` with object properties sorted recursively.
fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (i, (name, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

// Integral floats hash like integers so `1.0` and `1` name the same entry.
#[expect(clippy::cast_possible_truncation, reason = "guarded by the integral range check")]
fn write_number(n: &serde_json::Number, out: &mut String) {
    if let Some(f) = n.as_f64().filter(|_| n.is_f64())
        && f.fract() == 0.0
        && f.abs() < 9_007_199_254_740_992.0
    {
        let _ = write!(out, "{}", f as i64);
        return;
    }

    let _ = write!(out, "{n}");
}

fn write_string(s: &str, out: &mut String) {
    // serde_json's string escaping is canonical for a given input.
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => out.push_str(s),
    }
}

fn partial_match(value: &Value, filter: &Value) -> bool {
    match (value, filter) {
        (Value::Array(items), Value::Array(prefix)) => {
            prefix.len() <= items.len() && prefix.iter().zip(items).all(|(f, v)| partial_match(v, f))
        }
        (Value::Object(map), Value::Object(wanted)) => wanted
            .iter()
            .all(|(name, f)| map.get(name).is_some_and(|v| partial_match(v, f))),
        (Value::Number(a), Value::Number(b)) => {
            let mut left = String::new();
            let mut right = String::new();
            write_number(a, &mut left);
            write_number(b, &mut right);
            left == right
        }
        _ => value == filter,
    }
}
