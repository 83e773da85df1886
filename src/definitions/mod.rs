pub mod device_engagement;
pub mod device_key;
pub mod device_request;
pub mod helpers;
pub mod session;
pub mod x509;

pub use device_engagement::{
    BleOptions, DeviceEngagement, DeviceRetrievalMethod, NfcOptions, Security, WifiOptions,
};
pub use device_key::cose_key::{EC2Curve, EC2Y};
pub use device_key::CoseKey;
pub use device_request::{DeviceRequest, DocRequest, ItemsRequest};
pub use session::{
    EphemeralSecretKey, SessionData, SessionEncryption, SessionEstablishment, SessionTranscript,
};
