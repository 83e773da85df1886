//! Reader-side transport seam for the message exchange with a holder.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::definitions::device_engagement::{
    BleOptions, CentralClientMode, DeviceRetrievalMethod, NfcOptions, PeripheralServerMode,
    WifiOptions,
};
use crate::definitions::session::Role;
use crate::definitions::CoseKey;

/// A way of reaching the holder, as advertised in the device engagement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMethod {
    Ble(BleOptions),
    Nfc(NfcOptions),
    WifiAware(WifiOptions),
}

impl ConnectionMethod {
    /// Turns advertised retrieval methods into connection methods with a single mode each.
    ///
    /// A BLE entry offering both central client and peripheral server mode becomes two methods,
    /// central client mode first.
    pub fn disambiguate(methods: &[DeviceRetrievalMethod]) -> Vec<ConnectionMethod> {
        let mut disambiguated = Vec::with_capacity(methods.len());
        for method in methods {
            match method {
                DeviceRetrievalMethod::BLE(BleOptions {
                    peripheral_server_mode: Some(peripheral),
                    central_client_mode: Some(central),
                }) => {
                    disambiguated.push(ConnectionMethod::Ble(BleOptions {
                        peripheral_server_mode: None,
                        central_client_mode: Some(central.clone()),
                    }));
                    disambiguated.push(ConnectionMethod::Ble(BleOptions {
                        peripheral_server_mode: Some(peripheral.clone()),
                        central_client_mode: None,
                    }));
                }
                DeviceRetrievalMethod::BLE(options) => {
                    disambiguated.push(ConnectionMethod::Ble(options.clone()))
                }
                DeviceRetrievalMethod::NFC(options) => {
                    disambiguated.push(ConnectionMethod::Nfc(options.clone()))
                }
                DeviceRetrievalMethod::WIFI(options) => {
                    disambiguated.push(ConnectionMethod::WifiAware(options.clone()))
                }
            }
        }
        disambiguated
    }

    /// BLE central client mode, the mode a reader acts as peripheral for.
    pub fn ble_central_client(uuid: Uuid) -> Self {
        ConnectionMethod::Ble(BleOptions {
            peripheral_server_mode: None,
            central_client_mode: Some(CentralClientMode { uuid }),
        })
    }

    pub fn ble_peripheral_server(uuid: Uuid) -> Self {
        ConnectionMethod::Ble(BleOptions {
            peripheral_server_mode: Some(PeripheralServerMode {
                uuid,
                ble_device_address: None,
            }),
            central_client_mode: None,
        })
    }
}

/// Options applied when a transport is created from a [ConnectionMethod].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    /// Use L2CAP connection-oriented channels when the holder supports them.
    pub ble_use_l2cap: bool,
    /// Clear the platform's GATT cache before connecting.
    pub ble_clear_cache: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("connection method not supported: {0:?}")]
    UnsupportedConnectionMethod(ConnectionMethod),
    #[error("transport failure: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A byte-oriented, message-framed channel to the holder.
///
/// Implementations are shared behind an [Arc] and use interior mutability, so a caller can
/// hand an already-connected transport to the reader and still observe it.
#[async_trait]
pub trait MdocTransport: Send + Sync {
    fn connection_method(&self) -> ConnectionMethod;

    /// Connects to the holder identified by its ephemeral device key. Opening an already open
    /// transport is a no-op.
    async fn open(&self, e_device_key: &CoseKey) -> Result<(), TransportError>;

    async fn send_message(&self, message: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next message. An empty message means the holder ended the session through
    /// the transport rather than with a status code.
    async fn wait_for_message(&self) -> Result<Vec<u8>, TransportError>;

    /// Idempotent.
    async fn close(&self);

    /// Time spent scanning for the holder, when the transport had to scan.
    fn scanning_time(&self) -> Option<Duration>;
}

/// Creates transports for connection methods the platform supports.
pub trait MdocTransportFactory: Send + Sync {
    fn create_transport(
        &self,
        connection_method: &ConnectionMethod,
        role: Role,
        options: &TransportOptions,
    ) -> Result<Arc<dyn MdocTransport>, TransportError>;
}
