//! Reader backend client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderBackendConfig {
    /// Base URL of the reader backend; RPCs go to `{url}/{method}`.
    pub url: String,
    /// Target number of certified keys kept in the pool.
    pub num_keys: usize,
    pub request_timeout_secs: u64,
}

impl Default for ReaderBackendConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8020".to_string(),
            num_keys: 10,
            request_timeout_secs: 30,
        }
    }
}

impl ReaderBackendConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_num_keys(mut self, num_keys: usize) -> Self {
        self.num_keys = num_keys;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
