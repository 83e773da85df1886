//! Session establishment and encryption, ISO/IEC 18013-5 §9.1.1.
//!
//! Both parties derive `SKReader` and `SKDevice` from the ECDH shared secret of the two ephemeral
//! keys, salted with the hash of the tagged session transcript. Each direction keeps its own
//! message counter, which feeds the AES-GCM nonce.
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use ciborium::Value;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::cbor::{self, CborError};
use crate::definitions::device_engagement::EReaderKeyBytes;
use crate::definitions::device_key::cose_key;
use crate::definitions::helpers::tag24;
use crate::definitions::helpers::Tag24;
use crate::definitions::{CoseKey, EC2Curve};

/// Status code for a session-specific encryption error.
pub const STATUS_ERROR_SESSION_ENCRYPTION: u64 = 10;
/// Status code for a CBOR decoding error.
pub const STATUS_ERROR_CBOR_DECODING: u64 = 11;
/// Status code for session termination.
pub const STATUS_SESSION_TERMINATION: u64 = 20;

const READER_IDENTIFIER: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 0];
const DEVICE_IDENTIFIER: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 1];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ephemeral keys on {0:?} are not supported")]
    UnsupportedCurve(EC2Curve),
    #[error("the other party's ephemeral key is not a valid point on {0:?}")]
    InvalidPublicKey(EC2Curve),
    #[error("session key derivation failed")]
    KeyDerivation,
    #[error("failed to encrypt the message")]
    Encryption,
    #[error("failed to decrypt the message, counter {0}")]
    Decryption(u32),
    #[error("malformed session message: {0}")]
    MalformedMessage(&'static str),
    #[error("a message must carry data, a status or both")]
    EmptyMessage,
    #[error(transparent)]
    Cbor(#[from] CborError),
    #[error(transparent)]
    Tag24(#[from] tag24::Error),
}

/// Which side of the exchange this end is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    MdocReader,
    Mdoc,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEstablishment {
    pub e_reader_key: EReaderKeyBytes,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u64>,
}

/// An ephemeral private key for session establishment, on the curve the holder chose.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EphemeralSecretKey {
    P256(p256::SecretKey),
    P384(p384::SecretKey),
}

impl EphemeralSecretKey {
    pub fn generate(curve: EC2Curve) -> Result<Self, Error> {
        match curve {
            EC2Curve::P256 => Ok(Self::P256(p256::SecretKey::random(&mut rand::thread_rng()))),
            EC2Curve::P384 => Ok(Self::P384(p384::SecretKey::random(&mut rand::thread_rng()))),
            EC2Curve::P521 => Err(Error::UnsupportedCurve(curve)),
        }
    }

    pub fn curve(&self) -> EC2Curve {
        match self {
            Self::P256(_) => EC2Curve::P256,
            Self::P384(_) => EC2Curve::P384,
        }
    }

    pub fn public_key(&self) -> CoseKey {
        match self {
            Self::P256(key) => CoseKey::from(&key.public_key()),
            Self::P384(key) => CoseKey::from(&key.public_key()),
        }
    }

    /// ECDH with the other party's ephemeral key, which must be on the same curve.
    fn shared_secret(&self, remote: &CoseKey) -> Result<Zeroizing<Vec<u8>>, Error> {
        if remote.curve() != self.curve() {
            return Err(Error::UnsupportedCurve(remote.curve()));
        }
        let invalid = |_: cose_key::Error| Error::InvalidPublicKey(self.curve());
        let secret = match self {
            Self::P256(key) => {
                let remote = p256::PublicKey::try_from(remote).map_err(invalid)?;
                p256::ecdh::diffie_hellman(key.to_nonzero_scalar(), remote.as_affine())
                    .raw_secret_bytes()
                    .to_vec()
            }
            Self::P384(key) => {
                let remote = p384::PublicKey::try_from(remote).map_err(invalid)?;
                p384::ecdh::diffie_hellman(key.to_nonzero_scalar(), remote.as_affine())
                    .raw_secret_bytes()
                    .to_vec()
            }
        };
        Ok(Zeroizing::new(secret))
    }
}

impl From<p256::SecretKey> for EphemeralSecretKey {
    fn from(key: p256::SecretKey) -> Self {
        Self::P256(key)
    }
}

impl From<p384::SecretKey> for EphemeralSecretKey {
    fn from(key: p384::SecretKey) -> Self {
        Self::P384(key)
    }
}

/// `SessionTranscript = [DeviceEngagementBytes, EReaderKeyBytes, Handover]`.
///
/// The engagement bytes are kept exactly as received so that both sides hash the same input.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionTranscript {
    pub device_engagement_bytes: Vec<u8>,
    pub e_reader_key_bytes: Vec<u8>,
    pub handover: Value,
}

impl SessionTranscript {
    pub fn new(device_engagement_bytes: Vec<u8>, e_reader_key: &CoseKey, handover: Value) -> Result<Self, Error> {
        Ok(Self {
            device_engagement_bytes,
            e_reader_key_bytes: e_reader_key.to_bytes()?,
            handover,
        })
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Tag(24, Box::new(Value::Bytes(self.device_engagement_bytes.clone()))),
            Value::Tag(24, Box::new(Value::Bytes(self.e_reader_key_bytes.clone()))),
            self.handover.clone(),
        ])
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(cbor::to_vec(&self.to_value())?)
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKeys {
    sk_reader: [u8; 32],
    sk_device: [u8; 32],
}

/// Encrypts and decrypts session messages for one side of a presentation.
pub struct SessionEncryption {
    role: Role,
    keys: SessionKeys,
    e_reader_key: EReaderKeyBytes,
    encrypted_counter: u32,
    decrypted_counter: u32,
    session_establishment_sent: bool,
}

impl std::fmt::Debug for SessionEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEncryption")
            .field("role", &self.role)
            .field("encrypted_counter", &self.encrypted_counter)
            .field("decrypted_counter", &self.decrypted_counter)
            .finish_non_exhaustive()
    }
}

impl SessionEncryption {
    /// `e_self_key` is this side's ephemeral private key, `remote_key` the other side's
    /// ephemeral public key and `e_reader_key` the reader's ephemeral public key.
    pub fn new(
        role: Role,
        e_self_key: &EphemeralSecretKey,
        remote_key: &CoseKey,
        e_reader_key: &CoseKey,
        encoded_session_transcript: &[u8],
    ) -> Result<Self, Error> {
        let shared_secret = e_self_key.shared_secret(remote_key)?;
        let salt = transcript_salt(encoded_session_transcript)?;
        let keys = SessionKeys {
            sk_reader: derive_session_key(&shared_secret, &salt, b"SKReader")?,
            sk_device: derive_session_key(&shared_secret, &salt, b"SKDevice")?,
        };
        Ok(Self {
            role,
            keys,
            e_reader_key: Tag24::new(e_reader_key.clone())?,
            encrypted_counter: 1,
            decrypted_counter: 1,
            session_establishment_sent: false,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Encrypt `data` and wrap it, with the optional status, in a session message.
    ///
    /// The first message sent by a reader is a `SessionEstablishment`; every other message is a
    /// `SessionData`.
    pub fn encrypt_message(&mut self, data: Option<&[u8]>, status: Option<u64>) -> Result<Vec<u8>, Error> {
        let ciphertext = data.map(|plaintext| self.encrypt(plaintext)).transpose()?;
        if self.role == Role::MdocReader && !self.session_establishment_sent {
            let data = ciphertext.ok_or(Error::MalformedMessage(
                "session establishment must carry a request",
            ))?;
            self.session_establishment_sent = true;
            return Ok(cbor::to_vec(&SessionEstablishment {
                e_reader_key: self.e_reader_key.clone(),
                data,
            })?);
        }
        if ciphertext.is_none() && status.is_none() {
            return Err(Error::EmptyMessage);
        }
        Ok(cbor::to_vec(&SessionData {
            data: ciphertext,
            status,
        })?)
    }

    /// Decrypt a `SessionEstablishment` or `SessionData` message from the other side.
    pub fn decrypt_message(&mut self, message: &[u8]) -> Result<(Option<Vec<u8>>, Option<u64>), Error> {
        let Value::Map(entries) = cbor::from_slice::<Value>(message)? else {
            return Err(Error::MalformedMessage("session message is not a map"));
        };
        let status = match cbor::map_get(&entries, "status") {
            Some(Value::Integer(status)) => Some(
                u64::try_from(*status).map_err(|_| Error::MalformedMessage("negative status"))?,
            ),
            Some(_) => return Err(Error::MalformedMessage("status is not an integer")),
            None => None,
        };
        let plaintext = match cbor::map_get(&entries, "data") {
            Some(Value::Bytes(ciphertext)) => Some(self.decrypt(ciphertext)?),
            Some(_) => return Err(Error::MalformedMessage("data is not a byte string")),
            None => None,
        };
        Ok((plaintext, status))
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let (key, identifier) = match self.role {
            Role::MdocReader => (&self.keys.sk_reader, READER_IDENTIFIER),
            Role::Mdoc => (&self.keys.sk_device, DEVICE_IDENTIFIER),
        };
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let iv = nonce(identifier, self.encrypted_counter);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| Error::Encryption)?;
        self.encrypted_counter += 1;
        Ok(ciphertext)
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let (key, identifier) = match self.role {
            Role::MdocReader => (&self.keys.sk_device, DEVICE_IDENTIFIER),
            Role::Mdoc => (&self.keys.sk_reader, READER_IDENTIFIER),
        };
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let iv = nonce(identifier, self.decrypted_counter);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext)
            .map_err(|_| Error::Decryption(self.decrypted_counter))?;
        self.decrypted_counter += 1;
        Ok(plaintext)
    }
}

/// Encode a `SessionData` carrying only a status, e.g. session termination.
pub fn encode_status(status: u64) -> Result<Vec<u8>, Error> {
    Ok(cbor::to_vec(&SessionData {
        data: None,
        status: Some(status),
    })?)
}

/// Read the `eReaderKey` of a `SessionEstablishment` message, as the holder does on receipt.
pub fn e_reader_key_from_establishment(message: &[u8]) -> Result<CoseKey, Error> {
    let establishment: SessionEstablishment = cbor::from_slice(message)?;
    Ok(establishment.e_reader_key.into_inner())
}

fn transcript_salt(encoded_session_transcript: &[u8]) -> Result<[u8; 32], Error> {
    let tagged = cbor::to_vec(&Value::Tag(
        24,
        Box::new(Value::Bytes(encoded_session_transcript.to_vec())),
    ))?;
    Ok(Sha256::digest(tagged).into())
}

fn derive_session_key(shared_secret: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], Error> {
    let mut okm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(salt), shared_secret)
        .expand(info, &mut okm)
        .map_err(|_| Error::KeyDerivation)?;
    Ok(okm)
}

fn nonce(identifier: [u8; 8], counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[..8].copy_from_slice(&identifier);
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}
