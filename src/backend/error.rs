use super::device_check::DeviceCheckError;
use super::records::ReaderIdentitySelector;
use super::rpc::{RpcError, RpcStatus};
use super::secure_area::SecureAreaError;
use super::storage::StorageError;
use crate::cbor::CborError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors from the reader backend client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend refused to certify keys for this identity, e.g. the account lost access.
    #[error("reader identity not available: {0}")]
    ReaderIdentityNotAvailable(ReaderIdentitySelector),
    #[error("no valid reader keys available")]
    NoValidKeys,
    #[error("no pooled key with alias '{0}'")]
    NoSuchKey(String),
    #[error("the backend forgot the registration again after re-registering")]
    RegistrationLost,
    #[error("RPC '{method}' returned {status}{}", detail(.message))]
    UnexpectedStatus {
        method: &'static str,
        status: RpcStatus,
        message: Option<String>,
    },
    #[error("malformed '{method}' response: {reason}")]
    MalformedResponse {
        method: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    SecureArea(#[from] SecureAreaError),
    #[error(transparent)]
    Attestation(#[from] DeviceCheckError),
    #[error("invalid certificate chain: {0:#}")]
    Certificate(anyhow::Error),
    #[error(transparent)]
    Cbor(#[from] CborError),
}

fn detail(message: &Option<String>) -> String {
    message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
}

impl Error {
    pub(crate) fn malformed(method: &'static str, reason: impl Into<String>) -> Self {
        Error::MalformedResponse {
            method,
            reason: reason.into(),
        }
    }
}
