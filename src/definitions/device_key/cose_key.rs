use ciborium::Value;
use coset::iana::Algorithm;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use serde::{Deserialize, Serialize};

use crate::cbor;

/// An implementation of RFC-8152 [COSE_Key](https://datatracker.ietf.org/doc/html/rfc8152#section-13)
/// restricted to the EC2 keys used for mdoc session establishment.
///
/// P-256 and P-384 keys convert to and from their `PublicKey` types; P-521 is only decoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub enum CoseKey {
    EC2 { crv: EC2Curve, x: Vec<u8>, y: EC2Y },
}

/// The sign bit or value of the y-coordinate for the EC point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EC2Y {
    Value(Vec<u8>),
    SignBit(bool),
}

/// The RFC-8152 identifier of the curve, for EC2 key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EC2Curve {
    P256,
    P384,
    P521,
}

/// Errors that can occur when deserialising a COSE_Key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("COSE_Key of kty 'EC2' missing x coordinate")]
    EC2MissingX,
    #[error("COSE_Key of kty 'EC2' missing y coordinate")]
    EC2MissingY,
    #[error("Expected to parse a CBOR bool or bstr for y-coordinate, received: '{0:?}'")]
    InvalidTypeY(Value),
    #[error("Expected to parse a CBOR map, received: '{0:?}'")]
    NotAMap(Value),
    #[error("This implementation of COSE_Key only supports P-256 and P-384 keys for key agreement")]
    UnsupportedCurve,
    #[error("This implementation of COSE_Key only supports EC2 keys")]
    UnsupportedKeyType,
    #[error("Could not reconstruct coordinates from the provided COSE_Key")]
    InvalidCoseKey,
}

impl CoseKey {
    pub fn curve(&self) -> EC2Curve {
        match self {
            CoseKey::EC2 { crv, .. } => *crv,
        }
    }

    pub fn signature_algorithm(&self) -> Algorithm {
        match self.curve() {
            EC2Curve::P256 => Algorithm::ES256,
            EC2Curve::P384 => Algorithm::ES384,
            EC2Curve::P521 => Algorithm::ES512,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, cbor::CborError> {
        cbor::to_vec(self)
    }
}

impl From<CoseKey> for Value {
    fn from(key: CoseKey) -> Value {
        let CoseKey::EC2 { crv, x, y } = key;
        Value::Map(vec![
            // kty: 1, EC2: 2
            (Value::Integer(1.into()), Value::Integer(2.into())),
            // crv: -1
            (Value::Integer((-1).into()), crv.into()),
            // x: -2
            (Value::Integer((-2).into()), Value::Bytes(x)),
            // y: -3
            (Value::Integer((-3).into()), y.into()),
        ])
    }
}

impl TryFrom<Value> for CoseKey {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let mut map = match v {
            Value::Map(_) => cbor::int_keyed_map(v).map_err(|_| Error::InvalidCoseKey)?,
            _ => return Err(Error::NotAMap(v)),
        };
        match (map.remove(&1), map.remove(&-1)) {
            (Some(Value::Integer(kty)), Some(Value::Integer(crv_id))) if i128::from(kty) == 2 => {
                let crv = EC2Curve::try_from(i128::from(crv_id))?;
                let x = match map.remove(&-2) {
                    Some(Value::Bytes(x)) => x,
                    Some(_) => return Err(Error::InvalidCoseKey),
                    None => return Err(Error::EC2MissingX),
                };
                let y = map.remove(&-3).ok_or(Error::EC2MissingY)?.try_into()?;
                Ok(Self::EC2 { crv, x, y })
            }
            _ => Err(Error::UnsupportedKeyType),
        }
    }
}

impl From<EC2Y> for Value {
    fn from(y: EC2Y) -> Value {
        match y {
            EC2Y::Value(s) => Value::Bytes(s),
            EC2Y::SignBit(b) => Value::Bool(b),
        }
    }
}

impl TryFrom<Value> for EC2Y {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        match v {
            Value::Bytes(s) => Ok(EC2Y::Value(s)),
            Value::Bool(b) => Ok(EC2Y::SignBit(b)),
            _ => Err(Error::InvalidTypeY(v)),
        }
    }
}

impl From<EC2Curve> for Value {
    fn from(crv: EC2Curve) -> Value {
        let id: i64 = match crv {
            EC2Curve::P256 => 1,
            EC2Curve::P384 => 2,
            EC2Curve::P521 => 3,
        };
        Value::Integer(id.into())
    }
}

impl TryFrom<i128> for EC2Curve {
    type Error = Error;

    fn try_from(crv_id: i128) -> Result<Self, Error> {
        match crv_id {
            1 => Ok(EC2Curve::P256),
            2 => Ok(EC2Curve::P384),
            3 => Ok(EC2Curve::P521),
            _ => Err(Error::UnsupportedCurve),
        }
    }
}

impl CoseKey {
    /// Builds an EC2 key from an uncompressed SEC1 point on `crv`.
    fn from_uncompressed_point(crv: EC2Curve, point: &[u8]) -> Self {
        // 0x04 || x || y, both coordinates the same length.
        let coordinates = point.get(1..).unwrap_or_default();
        let (x, y) = coordinates.split_at(coordinates.len() / 2);
        CoseKey::EC2 {
            crv,
            x: x.to_vec(),
            y: EC2Y::Value(y.to_vec()),
        }
    }

    /// SEC1 encoding of the point, provided the key is on `expected`.
    fn sec1_bytes(&self, expected: EC2Curve) -> Result<Vec<u8>, Error> {
        let CoseKey::EC2 { crv, x, y } = self;
        if *crv != expected {
            return Err(Error::UnsupportedCurve);
        }
        let coordinate_len = expected.coordinate_len();
        if x.len() != coordinate_len {
            return Err(Error::InvalidCoseKey);
        }
        let mut bytes = Vec::with_capacity(1 + 2 * coordinate_len);
        match y {
            EC2Y::Value(y) => {
                if y.len() != coordinate_len {
                    return Err(Error::InvalidCoseKey);
                }
                bytes.push(4);
                bytes.extend_from_slice(x);
                bytes.extend_from_slice(y);
            }
            EC2Y::SignBit(odd) => {
                bytes.push(if *odd { 3 } else { 2 });
                bytes.extend_from_slice(x);
            }
        }
        Ok(bytes)
    }
}

impl EC2Curve {
    fn coordinate_len(&self) -> usize {
        match self {
            EC2Curve::P256 => 32,
            EC2Curve::P384 => 48,
            EC2Curve::P521 => 66,
        }
    }
}

impl From<&PublicKey> for CoseKey {
    fn from(key: &PublicKey) -> Self {
        CoseKey::from_uncompressed_point(EC2Curve::P256, key.to_encoded_point(false).as_bytes())
    }
}

impl From<&p384::PublicKey> for CoseKey {
    fn from(key: &p384::PublicKey) -> Self {
        CoseKey::from_uncompressed_point(EC2Curve::P384, key.to_encoded_point(false).as_bytes())
    }
}

impl TryFrom<&CoseKey> for PublicKey {
    type Error = Error;

    fn try_from(key: &CoseKey) -> Result<Self, Error> {
        PublicKey::from_sec1_bytes(&key.sec1_bytes(EC2Curve::P256)?)
            .map_err(|_| Error::InvalidCoseKey)
    }
}

impl TryFrom<&CoseKey> for p384::PublicKey {
    type Error = Error;

    fn try_from(key: &CoseKey) -> Result<Self, Error> {
        p384::PublicKey::from_sec1_bytes(&key.sec1_bytes(EC2Curve::P384)?)
            .map_err(|_| Error::InvalidCoseKey)
    }
}
