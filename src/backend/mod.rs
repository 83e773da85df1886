//! Reader backend: registration, certified reader key pool and issuer trust list.
mod client;
pub mod device_check;
mod error;
pub mod records;
pub(crate) mod registration;
#[cfg(feature = "reqwest")]
pub mod reqwest_transport;
pub mod rpc;
pub mod secure_area;
pub mod storage;
pub mod trust;

pub use client::ReaderBackendClient;
pub use device_check::{
    Assertion, DeviceAttestationResult, DeviceCheck, DeviceCheckError, SignedAssertion,
    SoftwareAttestation, SoftwareDeviceCheck,
};
pub use error::{Error, Result};
pub use records::{CertifiedKeyRecord, ReaderIdentity, ReaderIdentitySelector, RegistrationRecord};
#[cfg(feature = "reqwest")]
pub use reqwest_transport::HttpRpcTransport;
pub use rpc::{RpcError, RpcStatus, RpcTransport};
pub use secure_area::{CreateKeySettings, KeyInfo, SecureArea, SecureAreaError, SoftwareSecureArea};
pub use storage::{EphemeralStorage, Storage, StorageError, StorageTableSpec};
pub use trust::{TrustEntry, TrustMetadata};
