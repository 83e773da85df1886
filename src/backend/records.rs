use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use time::{Duration, OffsetDateTime};

use super::storage::StorageTableSpec;
use crate::cbor::{self, CborError};
use crate::definitions::x509::X5Chain;

pub(crate) const REGISTRATION_TABLE: StorageTableSpec =
    StorageTableSpec::new("ReaderBackendClientRegistrationData");
pub(crate) const REGISTRATION_ROW: &str = "default";
/// Table holding one [CertifiedKeyRecord] per pooled key.
pub const CERTIFIED_KEYS_TABLE: StorageTableSpec =
    StorageTableSpec::new("ReaderBackendClientCertifiedKeys");

/// The client's registration with the reader backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    /// Alias of the attested key used for assertions.
    pub device_attestation_id: String,
    /// Opaque handle the backend assigned at registration.
    pub registration_id: String,
}

/// Which reader identity a key is certified for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReaderIdentitySelector {
    /// Generic reader certificate without account details.
    Generic,
    /// Generic reader certificate carrying the signed-in account's details.
    GenericWithAccountDetails,
    /// A reader identity the signed-in account has been granted.
    Named(String),
}

impl ReaderIdentitySelector {
    /// Value of `readerIdentity` in a `certifyKeys` request; `None` means the field is omitted.
    pub fn wire_value(&self) -> Option<&str> {
        match self {
            ReaderIdentitySelector::Generic => None,
            ReaderIdentitySelector::GenericWithAccountDetails => Some(""),
            ReaderIdentitySelector::Named(id) => Some(id),
        }
    }
}

impl std::fmt::Display for ReaderIdentitySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderIdentitySelector::Generic => write!(f, "generic"),
            ReaderIdentitySelector::GenericWithAccountDetails => write!(f, "generic+account"),
            ReaderIdentitySelector::Named(id) => write!(f, "identity '{id}'"),
        }
    }
}

/// A reader identity available to the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderIdentity {
    pub id: String,
    pub display_name: String,
    pub display_icon: Option<Vec<u8>>,
}

/// A reader key in the secure area together with the backend's certification of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertifiedKeyRecord {
    pub alias: String,
    /// DER certificates, end-entity first.
    pub certification: Vec<ByteBuf>,
    #[serde(with = "time::serde::timestamp")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub valid_until: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub refresh_at: OffsetDateTime,
    pub for_reader_identity: ReaderIdentitySelector,
}

impl CertifiedKeyRecord {
    /// Build a record from the backend's chain; the validity window is the end-entity
    /// certificate's.
    pub fn new(
        alias: String,
        chain: &X5Chain,
        for_reader_identity: ReaderIdentitySelector,
    ) -> anyhow::Result<Self> {
        let (valid_from, valid_until) = chain.validity()?;
        Ok(Self {
            alias,
            certification: chain
                .der_certificates()
                .into_iter()
                .map(ByteBuf::from)
                .collect(),
            valid_from,
            valid_until,
            refresh_at: refresh_at(valid_from, valid_until),
            for_reader_identity,
        })
    }

    pub fn x5chain(&self) -> anyhow::Result<X5Chain> {
        X5Chain::from_der_certificates(&self.certification)
    }

    /// Strictly inside the validity window.
    pub fn is_valid_at(&self, at: OffsetDateTime) -> bool {
        self.valid_from < at && at < self.valid_until
    }

    pub fn needs_refresh_at(&self, at: OffsetDateTime) -> bool {
        at > self.refresh_at
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CborError> {
        cbor::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CborError> {
        cbor::from_slice(bytes)
    }
}

/// Two thirds into the validity window, truncated to whole seconds.
pub fn refresh_at(valid_from: OffsetDateTime, valid_until: OffsetDateTime) -> OffsetDateTime {
    let lifetime = (valid_until - valid_from).whole_seconds();
    valid_from + Duration::seconds(lifetime * 2 / 3)
}
