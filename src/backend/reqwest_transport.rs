//! Reqwest-based [RpcTransport] talking to the reader backend over HTTPS.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use super::rpc::{RpcError, RpcStatus, RpcTransport};
use crate::config::ReaderBackendConfig;

/// Sends each RPC as `POST {url}/{method}` with a JSON body.
///
/// ```ignore
/// use identity_reader::backend::HttpRpcTransport;
/// use identity_reader::config::ReaderBackendConfig;
///
/// let transport = HttpRpcTransport::new(&ReaderBackendConfig::default())?;
/// ```
#[derive(Clone)]
pub struct HttpRpcTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRpcTransport {
    pub fn new(config: &ReaderBackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn call(&self, method: &str, request: Value) -> Result<(RpcStatus, Value), RpcError> {
        let url = format!("{}/{method}", self.base_url);
        let body = serde_json::to_vec(&request).map_err(|e| RpcError::new(method, e))?;

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| RpcError::new(method, e))?;
        let status = RpcStatus::from_http(response.status().as_u16());
        let body = response.bytes().await.map_err(|e| RpcError::new(method, e))?;

        let value = if body.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&body) {
                Ok(value) => value,
                // Error pages are not JSON; the status is what matters for them.
                Err(_) if status != RpcStatus::Ok => Value::Null,
                Err(e) => return Err(RpcError::new(method, e)),
            }
        };
        tracing::debug!(method, %status, "reader backend RPC completed");
        Ok((status, value))
    }
}
