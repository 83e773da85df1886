//! Thin helpers over [ciborium] so the rest of the crate does not depend on its reader/writer API.
use std::collections::BTreeMap;

use ciborium::Value;
use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CborError {
    /// CBOR encoding failure.
    #[error("CBOR encoding failure: {0}")]
    EncodeFailed(String),
    /// CBOR decoding failure.
    #[error("CBOR decoding failure: {0}")]
    DecodeFailed(String),
    /// Unexpected CBOR item encountered (got, want).
    #[error("unexpected item: {0}, want {1}")]
    UnexpectedItem(&'static str, &'static str),
}

pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, CborError>
where
    T: Serialize + ?Sized,
{
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CborError::EncodeFailed(e.to_string()))?;
    Ok(buf)
}

pub fn from_slice<T>(slice: &[u8]) -> Result<T, CborError>
where
    T: DeserializeOwned,
{
    ciborium::from_reader(slice).map_err(|e| CborError::DecodeFailed(e.to_string()))
}

/// Convert a `ciborium::Value` into a type `T`
#[allow(clippy::needless_pass_by_value)]
pub fn from_value<T>(value: Value) -> Result<T, CborError>
where
    T: DeserializeOwned,
{
    value
        .deserialized()
        .map_err(|e| CborError::DecodeFailed(e.to_string()))
}

pub fn into_value<S>(v: S) -> Result<Value, CborError>
where
    S: Serialize,
{
    Value::serialized(&v).map_err(|e| CborError::EncodeFailed(e.to_string()))
}

/// Splits a CBOR map with integer keys into a [BTreeMap], so entries can be taken out by label.
pub fn int_keyed_map(value: Value) -> Result<BTreeMap<i128, Value>, CborError> {
    match value {
        Value::Map(entries) => entries
            .into_iter()
            .map(|(k, v)| match k {
                Value::Integer(i) => Ok((i128::from(i), v)),
                _ => Err(CborError::UnexpectedItem("non-integer key", "integer key")),
            })
            .collect(),
        _ => Err(CborError::UnexpectedItem("non-map", "map")),
    }
}

/// Looks up a text key in a CBOR map.
pub fn map_get<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(k, _)| matches!(k, Value::Text(t) if t == key))
        .map(|(_, v)| v)
}
