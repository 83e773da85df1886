use crate::definitions::device_key::cose_key::Error as CoseKeyError;
use crate::definitions::helpers::tag24::Error as Tag24Error;

/// Errors that can occur when deserialising a DeviceEngagement.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("Unsupported DeviceEngagement version '{0}'")]
    UnsupportedVersion(String),
    #[error("Unsupported device retrieval method")]
    UnsupportedDRM,
    #[error("Invalid DeviceEngagment found")]
    InvalidDeviceEngagement,
    #[error("Invalid WifiOptions found")]
    InvalidWifiOptions,
    #[error("Invalid NfcOptions found")]
    InvalidNfcOptions,
    #[error("Malformed object not recognised")]
    Malformed,
    #[error("Something went wrong parsing a cose key")]
    CoseKeyError,
    #[error("Something went wrong parsing a tag24")]
    Tag24Error,
    #[error("Could not serialize or deserialize cbor")]
    CborError,
    #[error("QR code URI is not an mdoc engagement")]
    InvalidQrCode,
}

impl From<CoseKeyError> for Error {
    fn from(_: CoseKeyError) -> Self {
        Error::CoseKeyError
    }
}

impl From<Tag24Error> for Error {
    fn from(_: Tag24Error) -> Self {
        Error::Tag24Error
    }
}

impl From<crate::cbor::CborError> for Error {
    fn from(_: crate::cbor::CborError) -> Self {
        Error::CborError
    }
}
