//! Transport for the reader backend's JSON RPCs.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::Value;

/// Outcome class of an RPC as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    Ok,
    /// The caller is not allowed what it asked for, e.g. a reader identity it has no access to.
    Forbidden,
    /// The backend does not know the registration the request refers to.
    NotFound,
    Other(u16),
}

impl RpcStatus {
    pub fn from_http(code: u16) -> Self {
        match code {
            200 => RpcStatus::Ok,
            403 => RpcStatus::Forbidden,
            404 => RpcStatus::NotFound,
            other => RpcStatus::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            RpcStatus::Ok => 200,
            RpcStatus::Forbidden => 403,
            RpcStatus::NotFound => 404,
            RpcStatus::Other(code) => *code,
        }
    }
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcStatus::Ok => write!(f, "OK"),
            RpcStatus::Forbidden => write!(f, "FORBIDDEN"),
            RpcStatus::NotFound => write!(f, "NOT_FOUND"),
            RpcStatus::Other(code) => write!(f, "HTTP {code}"),
        }
    }
}

/// A transport-level failure: the request did not produce a status at all.
#[derive(Debug, thiserror::Error)]
#[error("RPC '{method}' failed: {source}")]
pub struct RpcError {
    pub method: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl RpcError {
    pub fn new(method: &str, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            method: method.to_owned(),
            source: source.into(),
        }
    }
}

/// Carries a named RPC with a JSON object body to the backend.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, method: &str, request: Value) -> Result<(RpcStatus, Value), RpcError>;
}

/// Error returned when using `()` as an RPC transport (backend disabled).
#[derive(Debug, thiserror::Error)]
#[error("no reader backend configured")]
pub struct NoBackendError;

/// Implementation of [`RpcTransport`] for `()` that always fails, so a client built without a
/// backend behaves as if it were permanently offline.
#[async_trait]
impl RpcTransport for () {
    async fn call(&self, method: &str, _request: Value) -> Result<(RpcStatus, Value), RpcError> {
        Err(RpcError::new(method, NoBackendError))
    }
}

/// Binary fields on the wire are base64url without padding.
pub fn encode_bytes(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_codes_map_to_statuses() {
        assert_eq!(RpcStatus::from_http(200), RpcStatus::Ok);
        assert_eq!(RpcStatus::from_http(403), RpcStatus::Forbidden);
        assert_eq!(RpcStatus::from_http(404), RpcStatus::NotFound);
        assert_eq!(RpcStatus::from_http(500), RpcStatus::Other(500));
        assert_eq!(RpcStatus::Other(409).code(), 409);
    }

    #[tokio::test]
    async fn unit_transport_is_offline() {
        let err = ().call("getNonce", Value::Null).await.unwrap_err();
        assert_eq!(err.method, "getNonce");
    }

    #[test]
    fn bytes_are_unpadded_base64url() {
        assert_eq!(encode_bytes(&[0xfb, 0xff]), "-_8");
        assert_eq!(decode_bytes("-_8").unwrap(), vec![0xfb, 0xff]);
    }
}
