//! This module contains the definitions for the [DeviceEngagement] struct and related types.
//!
//! The [DeviceEngagement] struct is what the holder shows to the reader, either as a QR code or
//! over an NFC handover. It carries the holder's ephemeral key and the ways the holder can be
//! reached to exchange the request and response.
use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ciborium::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::Error;

use crate::cbor;
use crate::definitions::helpers::Tag24;
use crate::definitions::CoseKey;

pub mod error;

pub type EDeviceKeyBytes = Tag24<CoseKey>;
pub type EReaderKeyBytes = Tag24<CoseKey>;

/// Cipher suite identifier defined by ISO/IEC 18013-5 for ECDH + AES-256-GCM session encryption.
pub const CIPHER_SUITE_1: u64 = 1;

const SUPPORTED_VERSIONS: [&str; 2] = ["1.0", "1.1"];

/// Represents a device engagement.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub struct DeviceEngagement {
    /// The version of the device engagement.
    pub version: String,

    /// The security settings for the device engagement.
    pub security: Security,

    /// The device retrieval methods offered by the holder; empty for NFC negotiated handover.
    pub device_retrieval_methods: Vec<DeviceRetrievalMethod>,
}

/// Cipher suite and the holder's ephemeral public key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Security(pub u64, pub EDeviceKeyBytes);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceRetrievalMethod {
    WIFI(WifiOptions),
    BLE(BleOptions),
    NFC(NfcOptions),
}

/// Represents the options for `Bluetooth Low Energy` (BLE) device engagement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BleOptions {
    /// The peripheral server mode for `BLE` device engagement.
    pub peripheral_server_mode: Option<PeripheralServerMode>,

    /// The central client mode for `BLE` device engagement.
    pub central_client_mode: Option<CentralClientMode>,
}

/// Represents a peripheral server mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeripheralServerMode {
    /// The 'UUID' of the peripheral server.
    pub uuid: Uuid,

    /// The 'BLE' device address of the peripheral server, if available.
    pub ble_device_address: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CentralClientMode {
    pub uuid: Uuid,
}

/// Maximum APDU data field lengths advertised for NFC data transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NfcOptions {
    pub max_len_command_data_field: u64,
    pub max_len_response_data_field: u64,
}

/// Represents the options for a `Wi-Fi Aware` device engagement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WifiOptions {
    pub pass_phrase: Option<String>,
    pub channel_info_operating_class: Option<u64>,
    pub channel_info_channel_number: Option<u64>,
    pub band_info: Option<Vec<u8>>,
}

impl DeviceEngagement {
    pub fn new(e_device_key: CoseKey, methods: Vec<DeviceRetrievalMethod>) -> Result<Self, Error> {
        Ok(Self {
            version: "1.0".into(),
            security: Security(CIPHER_SUITE_1, Tag24::new(e_device_key)?),
            device_retrieval_methods: methods,
        })
    }

    pub fn e_device_key(&self) -> &CoseKey {
        self.security.1.as_ref()
    }
}

impl Tag24<DeviceEngagement> {
    pub fn to_qr_code_uri(&self) -> String {
        let mut qr_code_uri = String::from("mdoc:");
        URL_SAFE_NO_PAD.encode_string(&self.inner_bytes, &mut qr_code_uri);
        qr_code_uri
    }

    pub fn from_qr_code_uri(qr_code_uri: &str) -> Result<Self, Error> {
        let encoded_de = qr_code_uri
            .strip_prefix("mdoc:")
            .ok_or(Error::InvalidQrCode)?;
        let decoded_de = URL_SAFE_NO_PAD
            .decode(encoded_de)
            .map_err(|_| Error::InvalidQrCode)?;
        Ok(Tag24::<DeviceEngagement>::from_bytes(decoded_de)?)
    }
}

impl From<DeviceEngagement> for Value {
    fn from(device_engagement: DeviceEngagement) -> Value {
        let mut map = vec![
            (
                Value::Integer(0.into()),
                Value::Text(device_engagement.version),
            ),
            (
                Value::Integer(1.into()),
                Value::Array(vec![
                    Value::Integer(device_engagement.security.0.into()),
                    device_engagement.security.1.into(),
                ]),
            ),
        ];
        if !device_engagement.device_retrieval_methods.is_empty() {
            let methods = device_engagement
                .device_retrieval_methods
                .into_iter()
                .map(Value::from)
                .collect();
            map.push((Value::Integer(2.into()), Value::Array(methods)));
        }
        Value::Map(map)
    }
}

impl TryFrom<Value> for DeviceEngagement {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        if !matches!(v, Value::Map(_)) {
            return Err(Error::InvalidDeviceEngagement);
        }
        let mut map = cbor::int_keyed_map(v)?;

        let version = match map.remove(&0) {
            Some(Value::Text(v)) if SUPPORTED_VERSIONS.contains(&v.as_str()) => v,
            Some(Value::Text(v)) => return Err(Error::UnsupportedVersion(v)),
            _ => return Err(Error::Malformed),
        };

        let security = match map.remove(&1) {
            Some(Value::Array(items)) => match <[Value; 2]>::try_from(items) {
                Ok([Value::Integer(suite), key]) => {
                    let suite = u64::try_from(suite).map_err(|_| Error::Malformed)?;
                    Security(suite, Tag24::try_from(key)?)
                }
                _ => return Err(Error::Malformed),
            },
            _ => return Err(Error::Malformed),
        };

        let device_retrieval_methods = match map.remove(&2) {
            Some(Value::Array(methods)) => methods
                .into_iter()
                .map(DeviceRetrievalMethod::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(Error::Malformed),
            None => Vec::new(),
        };

        if map.contains_key(&3) {
            tracing::debug!("server retrieval is not supported, ignoring");
        }

        Ok(DeviceEngagement {
            version,
            security,
            device_retrieval_methods,
        })
    }
}

impl DeviceRetrievalMethod {
    pub fn version(&self) -> u64 {
        1
    }

    pub fn transport_type(&self) -> u64 {
        match self {
            Self::NFC(_) => 1,
            Self::BLE(_) => 2,
            Self::WIFI(_) => 3,
        }
    }
}

impl TryFrom<Value> for DeviceRetrievalMethod {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Array(list) = value else {
            return Err(Error::Malformed);
        };
        let [Value::Integer(transport_type), Value::Integer(_version), options]: [Value; 3] =
            list.try_into().map_err(|_| Error::Malformed)?
        else {
            return Err(Error::Malformed);
        };
        match i128::from(transport_type) {
            1 => Ok(DeviceRetrievalMethod::NFC(NfcOptions::try_from(options)?)),
            2 => Ok(DeviceRetrievalMethod::BLE(BleOptions::try_from(options)?)),
            3 => Ok(DeviceRetrievalMethod::WIFI(WifiOptions::try_from(options)?)),
            _ => Err(Error::UnsupportedDRM),
        }
    }
}

impl From<DeviceRetrievalMethod> for Value {
    fn from(drm: DeviceRetrievalMethod) -> Self {
        let transport_type = Value::Integer(drm.transport_type().into());
        let version = Value::Integer(drm.version().into());
        let retrieval_method = match drm {
            DeviceRetrievalMethod::NFC(opts) => opts.into(),
            DeviceRetrievalMethod::BLE(opts) => opts.into(),
            DeviceRetrievalMethod::WIFI(opts) => opts.into(),
        };
        Value::Array(vec![transport_type, version, retrieval_method])
    }
}

fn uuid_from(value: Value) -> Result<Uuid, Error> {
    match value {
        Value::Bytes(bytes) => {
            let bytes: [u8; 16] = bytes.try_into().map_err(|_| Error::Malformed)?;
            Ok(Uuid::from_bytes(bytes))
        }
        _ => Err(Error::Malformed),
    }
}

impl TryFrom<Value> for BleOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let mut map = cbor::int_keyed_map(v).map_err(|_| Error::Malformed)?;

        let peripheral_server_mode = match (map.remove(&0), map.remove(&10)) {
            (Some(Value::Bool(true)), Some(uuid)) => {
                let ble_device_address = match map.remove(&20) {
                    Some(Value::Bytes(address)) => Some(address),
                    Some(_) => return Err(Error::Malformed),
                    None => None,
                };
                Some(PeripheralServerMode {
                    uuid: uuid_from(uuid)?,
                    ble_device_address,
                })
            }
            (Some(Value::Bool(_)), _) => None,
            _ => return Err(Error::Malformed),
        };

        let central_client_mode = match (map.remove(&1), map.remove(&11)) {
            (Some(Value::Bool(true)), Some(uuid)) => Some(CentralClientMode {
                uuid: uuid_from(uuid)?,
            }),
            (Some(Value::Bool(_)), _) => None,
            _ => return Err(Error::Malformed),
        };

        Ok(BleOptions {
            peripheral_server_mode,
            central_client_mode,
        })
    }
}

impl From<BleOptions> for Value {
    fn from(o: BleOptions) -> Value {
        let mut map = vec![];

        match o.peripheral_server_mode {
            Some(PeripheralServerMode {
                uuid,
                ble_device_address,
            }) => {
                map.push((Value::Integer(0.into()), Value::Bool(true)));
                map.push((
                    Value::Integer(10.into()),
                    Value::Bytes(uuid.as_bytes().to_vec()),
                ));
                if let Some(address) = ble_device_address {
                    map.push((Value::Integer(20.into()), Value::Bytes(address)));
                }
            }
            None => map.push((Value::Integer(0.into()), Value::Bool(false))),
        }

        match o.central_client_mode {
            Some(CentralClientMode { uuid }) => {
                map.push((Value::Integer(1.into()), Value::Bool(true)));
                map.push((
                    Value::Integer(11.into()),
                    Value::Bytes(uuid.as_bytes().to_vec()),
                ));
            }
            None => map.push((Value::Integer(1.into()), Value::Bool(false))),
        }

        Value::Map(map)
    }
}

impl TryFrom<Value> for NfcOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let map = cbor::int_keyed_map(v).map_err(|_| Error::InvalidNfcOptions)?;
        let lookup = |idx: i128| match map.get(&idx) {
            Some(Value::Integer(i)) => u64::try_from(*i).map_err(|_| Error::InvalidNfcOptions),
            _ => Err(Error::InvalidNfcOptions),
        };
        Ok(NfcOptions {
            max_len_command_data_field: lookup(0)?,
            max_len_response_data_field: lookup(1)?,
        })
    }
}

impl From<NfcOptions> for Value {
    fn from(o: NfcOptions) -> Value {
        Value::Map(vec![
            (
                Value::Integer(0.into()),
                Value::Integer(o.max_len_command_data_field.into()),
            ),
            (
                Value::Integer(1.into()),
                Value::Integer(o.max_len_response_data_field.into()),
            ),
        ])
    }
}

impl TryFrom<Value> for WifiOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        fn lookup_opt_string(map: &BTreeMap<i128, Value>, idx: i128) -> Result<Option<String>, Error> {
            match map.get(&idx) {
                None => Ok(None),
                Some(Value::Text(text)) => Ok(Some(text.clone())),
                _ => Err(Error::InvalidWifiOptions),
            }
        }

        fn lookup_opt_u64(map: &BTreeMap<i128, Value>, idx: i128) -> Result<Option<u64>, Error> {
            match map.get(&idx) {
                None => Ok(None),
                Some(Value::Integer(int_val)) => u64::try_from(*int_val)
                    .map(Some)
                    .map_err(|_| Error::InvalidWifiOptions),
                _ => Err(Error::InvalidWifiOptions),
            }
        }

        let map = cbor::int_keyed_map(v).map_err(|_| Error::InvalidWifiOptions)?;
        let band_info = match map.get(&3) {
            None => None,
            Some(Value::Bytes(bytes)) => Some(bytes.clone()),
            _ => return Err(Error::InvalidWifiOptions),
        };

        Ok(WifiOptions {
            pass_phrase: lookup_opt_string(&map, 0)?,
            channel_info_operating_class: lookup_opt_u64(&map, 1)?,
            channel_info_channel_number: lookup_opt_u64(&map, 2)?,
            band_info,
        })
    }
}

impl From<WifiOptions> for Value {
    fn from(o: WifiOptions) -> Value {
        let mut map = vec![];
        if let Some(pass_phrase) = o.pass_phrase {
            map.push((Value::Integer(0.into()), Value::Text(pass_phrase)));
        }
        if let Some(class) = o.channel_info_operating_class {
            map.push((Value::Integer(1.into()), Value::Integer(class.into())));
        }
        if let Some(channel) = o.channel_info_channel_number {
            map.push((Value::Integer(2.into()), Value::Integer(channel.into())));
        }
        if let Some(band_info) = o.band_info {
            map.push((Value::Integer(3.into()), Value::Bytes(band_info)));
        }
        Value::Map(map)
    }
}
