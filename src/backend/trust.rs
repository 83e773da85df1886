//! Issuer trust list entries distributed by the reader backend.

use serde::{Deserialize, Serialize};

use crate::cbor::{self, CborError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub display_icon: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_policy_url: Option<String>,
    #[serde(default)]
    pub test_only: bool,
}

/// A trust anchor: either a single IACA certificate or a signed VICAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrustEntry {
    #[serde(rename_all = "camelCase")]
    X509Cert {
        metadata: TrustMetadata,
        /// DER encoded certificate.
        #[serde(with = "serde_bytes")]
        certificate: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Vical {
        metadata: TrustMetadata,
        #[serde(with = "serde_bytes")]
        encoded_signed_vical: Vec<u8>,
    },
}

impl TrustEntry {
    pub fn metadata(&self) -> &TrustMetadata {
        match self {
            TrustEntry::X509Cert { metadata, .. } | TrustEntry::Vical { metadata, .. } => metadata,
        }
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, CborError> {
        cbor::to_vec(self)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, CborError> {
        cbor::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_decode_to_what_was_encoded() {
        let entries = [
            TrustEntry::X509Cert {
                metadata: TrustMetadata {
                    display_name: Some("foo".into()),
                    display_icon: Some(vec![1, 2, 3]),
                    ..Default::default()
                },
                certificate: vec![10, 11, 12],
            },
            TrustEntry::Vical {
                metadata: TrustMetadata {
                    display_name: Some("bar".into()),
                    display_icon: Some(vec![4, 5, 6]),
                    test_only: true,
                    ..Default::default()
                },
                encoded_signed_vical: vec![20, 21, 22],
            },
        ];
        for entry in entries {
            let decoded = TrustEntry::from_cbor(&entry.to_cbor().unwrap()).unwrap();
            assert_eq!(decoded.metadata(), entry.metadata());
            assert_eq!(decoded, entry);
        }
    }
}
