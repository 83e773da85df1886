//! Device attestation and assertions proving the client holds the key it registered with.

use std::sync::Arc;

use async_trait::async_trait;
use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use super::secure_area::{CreateKeySettings, SecureArea, SecureAreaError};
use crate::cbor::{self, CborError};
use crate::definitions::CoseKey;

/// Statements a registered device can be asked to sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assertion {
    /// Proves possession of the attested key for a server-issued nonce.
    #[serde(rename = "AssertionNonce")]
    Nonce(#[serde(with = "serde_bytes")] Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct DeviceAttestationResult {
    pub device_attestation_id: String,
    pub device_attestation: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceCheckError {
    #[error(transparent)]
    SecureArea(#[from] SecureAreaError),
    #[error(transparent)]
    Cbor(#[from] CborError),
    #[error("attestation does not carry a usable P-256 key")]
    InvalidKey,
    #[error("assertion signature is invalid")]
    InvalidSignature,
}

#[async_trait]
pub trait DeviceCheck: Send + Sync {
    async fn generate_attestation(&self, challenge: &[u8]) -> Result<DeviceAttestationResult, DeviceCheckError>;

    async fn generate_assertion(
        &self,
        device_attestation_id: &str,
        assertion: &Assertion,
    ) -> Result<Vec<u8>, DeviceCheckError>;
}

/// Attestation produced by [SoftwareDeviceCheck]: the attested public key and the challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftwareAttestation {
    #[serde(with = "serde_bytes")]
    pub challenge: Vec<u8>,
    pub public_key: CoseKey,
}

/// An [Assertion] together with a DER ECDSA signature over its CBOR encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedAssertion {
    #[serde(with = "serde_bytes")]
    pub assertion: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl SoftwareAttestation {
    pub fn decode(bytes: &[u8]) -> Result<Self, DeviceCheckError> {
        Ok(cbor::from_slice(bytes)?)
    }

    /// Check a [SignedAssertion] against the attested key and return the assertion.
    pub fn verify_assertion(&self, signed_assertion: &[u8]) -> Result<Assertion, DeviceCheckError> {
        let signed: SignedAssertion = cbor::from_slice(signed_assertion)?;
        let public_key =
            p256::PublicKey::try_from(&self.public_key).map_err(|_| DeviceCheckError::InvalidKey)?;
        let signature =
            Signature::from_der(&signed.signature).map_err(|_| DeviceCheckError::InvalidSignature)?;
        VerifyingKey::from(&public_key)
            .verify(&signed.assertion, &signature)
            .map_err(|_| DeviceCheckError::InvalidSignature)?;
        Ok(cbor::from_slice(&signed.assertion)?)
    }
}

/// [DeviceCheck] backed by a key in a [SecureArea], for platforms without hardware attestation.
pub struct SoftwareDeviceCheck {
    secure_area: Arc<dyn SecureArea>,
}

impl SoftwareDeviceCheck {
    pub fn new(secure_area: Arc<dyn SecureArea>) -> Self {
        Self { secure_area }
    }
}

#[async_trait]
impl DeviceCheck for SoftwareDeviceCheck {
    async fn generate_attestation(&self, challenge: &[u8]) -> Result<DeviceAttestationResult, DeviceCheckError> {
        let key_info = self
            .secure_area
            .create_key(&CreateKeySettings::default())
            .await?;
        let attestation = SoftwareAttestation {
            challenge: challenge.to_vec(),
            public_key: CoseKey::from(&key_info.public_key),
        };
        Ok(DeviceAttestationResult {
            device_attestation_id: key_info.alias,
            device_attestation: cbor::to_vec(&attestation)?,
        })
    }

    async fn generate_assertion(
        &self,
        device_attestation_id: &str,
        assertion: &Assertion,
    ) -> Result<Vec<u8>, DeviceCheckError> {
        let assertion = cbor::to_vec(assertion)?;
        let signature = self
            .secure_area
            .sign(device_attestation_id, &assertion)
            .await?;
        Ok(cbor::to_vec(&SignedAssertion {
            assertion,
            signature: signature.to_der().as_bytes().to_vec(),
        })?)
    }
}
