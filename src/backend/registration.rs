//! One-time registration with the reader backend and the per-request proof of possession.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::device_check::{Assertion, DeviceCheck};
use super::error::{Error, Result};
use super::records::{RegistrationRecord, REGISTRATION_ROW, REGISTRATION_TABLE};
use super::rpc::{decode_bytes, encode_bytes, RpcStatus, RpcTransport};
use super::storage::Storage;
use crate::cbor;

/// Proof that the registered device holds its attested key, for one server nonce.
pub(crate) struct NonceAssertion {
    pub nonce: String,
    pub device_assertion: String,
}

impl NonceAssertion {
    /// Request body for a registration-bound RPC, before method-specific fields.
    pub fn request(&self, registration: &RegistrationRecord) -> serde_json::Map<String, Value> {
        let mut request = serde_json::Map::new();
        request.insert("registrationId".into(), json!(registration.registration_id));
        request.insert("nonce".into(), json!(self.nonce));
        request.insert("deviceAssertion".into(), json!(self.device_assertion));
        request
    }
}

pub(crate) struct RegistrationManager {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn RpcTransport>,
    device_check: Arc<dyn DeviceCheck>,
    lock: Mutex<()>,
}

impl RegistrationManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn RpcTransport>,
        device_check: Arc<dyn DeviceCheck>,
    ) -> Self {
        Self {
            storage,
            transport,
            device_check,
            lock: Mutex::new(()),
        }
    }

    pub async fn call(&self, method: &'static str, request: Value) -> Result<(RpcStatus, Value)> {
        tracing::debug!(method, "calling reader backend");
        let (status, response) = self.transport.call(method, request).await?;
        if status != RpcStatus::Ok {
            tracing::debug!(method, %status, "reader backend returned non-OK status");
        }
        Ok((status, response))
    }

    /// Returns the persisted registration, registering first if there is none.
    pub async fn ensure_registered(&self) -> Result<RegistrationRecord> {
        let _guard = self.lock.lock().await;
        if let Some(data) = self.storage.get(&REGISTRATION_TABLE, REGISTRATION_ROW).await? {
            return Ok(cbor::from_slice(&data)?);
        }

        let nonce = self.get_nonce().await?;
        let attestation = self.device_check.generate_attestation(&nonce).await?;
        let (status, response) = self
            .call(
                "register",
                json!({
                    "nonce": encode_bytes(&nonce),
                    "deviceAttestation": encode_bytes(&attestation.device_attestation),
                }),
            )
            .await?;
        check_ok("register", status, &response)?;
        let registration_id = string_field("register", &response, "registrationId")?.to_owned();

        let record = RegistrationRecord {
            device_attestation_id: attestation.device_attestation_id,
            registration_id,
        };
        self.storage
            .insert(&REGISTRATION_TABLE, Some(REGISTRATION_ROW), cbor::to_vec(&record)?)
            .await?;
        tracing::info!("registered with reader backend");
        Ok(record)
    }

    /// Drop the persisted registration after the backend reported it unknown.
    pub async fn forget(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        tracing::warn!("reader backend does not know our registration, will re-register");
        self.storage
            .delete(&REGISTRATION_TABLE, REGISTRATION_ROW)
            .await?;
        Ok(())
    }

    pub async fn get_nonce(&self) -> Result<Vec<u8>> {
        let (status, response) = self.call("getNonce", json!({})).await?;
        check_ok("getNonce", status, &response)?;
        let nonce = string_field("getNonce", &response, "nonce")?;
        decode_bytes(nonce).map_err(|e| Error::malformed("getNonce", e.to_string()))
    }

    /// `getNonce` followed by an assertion over the fresh nonce.
    pub async fn assert_nonce_possession(&self, registration: &RegistrationRecord) -> Result<NonceAssertion> {
        let nonce = self.get_nonce().await?;
        self.assert_possession_of(registration, &nonce).await
    }

    pub async fn assert_possession_of(
        &self,
        registration: &RegistrationRecord,
        nonce: &[u8],
    ) -> Result<NonceAssertion> {
        let assertion = self
            .device_check
            .generate_assertion(
                &registration.device_attestation_id,
                &Assertion::Nonce(nonce.to_vec()),
            )
            .await?;
        Ok(NonceAssertion {
            nonce: encode_bytes(nonce),
            device_assertion: encode_bytes(&assertion),
        })
    }
}

pub(crate) fn check_ok(method: &'static str, status: RpcStatus, response: &Value) -> Result<()> {
    if status == RpcStatus::Ok {
        return Ok(());
    }
    Err(unexpected_status(method, status, response))
}

pub(crate) fn unexpected_status(method: &'static str, status: RpcStatus, response: &Value) -> Error {
    Error::UnexpectedStatus {
        method,
        status,
        message: response
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_owned),
    }
}

pub(crate) fn string_field<'a>(method: &'static str, response: &'a Value, name: &str) -> Result<&'a str> {
    response
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::malformed(method, format!("missing string field '{name}'")))
}
