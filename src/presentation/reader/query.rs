//! Device requests for the presentations this reader supports.
use ciborium::Value;
use coset::{iana, sig_structure_data, AsCborValue, SignatureContext};
use p256::ecdsa::{Signature, SigningKey};
use signature::Signer;
use time::OffsetDateTime;

use super::Error;
use crate::backend::{self, ReaderBackendClient, ReaderIdentitySelector, SecureArea};
use crate::cbor::{self, CborError};
use crate::definitions::device_request::{DataElements, DeviceRequest, DocRequest, ItemsRequest};
use crate::definitions::helpers::Tag24;
use crate::definitions::x509::{X5Chain, X5CHAIN_COSE_HEADER_LABEL};

pub const MDL_DOCTYPE: &str = "org.iso.18013.5.1.mDL";
pub const MDL_NAMESPACE: &str = "org.iso.18013.5.1";

const IDENTIFICATION_ELEMENTS: [&str; 15] = [
    "given_name",
    "family_name",
    "birth_date",
    "birth_place",
    "sex",
    "portrait",
    "resident_address",
    "resident_city",
    "resident_state",
    "resident_postal_code",
    "resident_country",
    "issuing_authority",
    "document_number",
    "issue_date",
    "expiry_date",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderQuery {
    AgeOver18,
    AgeOver21,
    Identification,
}

/// How the request is authenticated to the holder.
#[derive(Debug, Clone)]
pub enum ReaderAuthMethod {
    NoReaderAuth,
    /// Key certified by the reader backend for the generic reader identity.
    StandardReaderAuth,
    StandardReaderAuthWithAccountDetails,
    /// Key certified for a reader identity of the signed-in account.
    IdentityFromAccount(String),
    /// A key and certificate chain provisioned by the user.
    CustomKey { key: SigningKey, chain: X5Chain },
}

impl ReaderAuthMethod {
    fn backend_selector(&self) -> Option<ReaderIdentitySelector> {
        match self {
            ReaderAuthMethod::StandardReaderAuth => Some(ReaderIdentitySelector::Generic),
            ReaderAuthMethod::StandardReaderAuthWithAccountDetails => {
                Some(ReaderIdentitySelector::GenericWithAccountDetails)
            }
            ReaderAuthMethod::IdentityFromAccount(id) => {
                Some(ReaderIdentitySelector::Named(id.clone()))
            }
            ReaderAuthMethod::NoReaderAuth | ReaderAuthMethod::CustomKey { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedRequest {
    pub encoded_device_request: Vec<u8>,
    /// The configured reader identity is no longer available to the account; the request was
    /// signed with a generic key if one could be had. Callers should fall back to
    /// [ReaderAuthMethod::StandardReaderAuth].
    pub reader_identity_revoked: bool,
}

enum ReaderKey<'a> {
    SecureArea {
        secure_area: &'a dyn SecureArea,
        alias: &'a str,
    },
    Explicit(&'a SigningKey),
}

impl ReaderKey<'_> {
    async fn sign(&self, data: &[u8]) -> Result<Signature, Error> {
        match self {
            ReaderKey::SecureArea { secure_area, alias } => Ok(secure_area.sign(alias, data).await?),
            ReaderKey::Explicit(key) => Ok(key.sign(data)),
        }
    }
}

impl ReaderQuery {
    pub fn display_name(&self) -> &'static str {
        match self {
            ReaderQuery::AgeOver18 => "Age Over 18",
            ReaderQuery::AgeOver21 => "Age Over 21",
            ReaderQuery::Identification => "Identification",
        }
    }

    pub fn data_elements(&self) -> &'static [&'static str] {
        match self {
            ReaderQuery::AgeOver18 => &["age_over_18", "portrait"],
            ReaderQuery::AgeOver21 => &["age_over_21", "portrait"],
            ReaderQuery::Identification => &IDENTIFICATION_ELEMENTS,
        }
    }

    pub fn items_request(&self, intent_to_retain: bool) -> ItemsRequest {
        let elements: DataElements = self
            .data_elements()
            .iter()
            .map(|element| (element.to_string(), intent_to_retain))
            .collect();
        ItemsRequest {
            doc_type: MDL_DOCTYPE.into(),
            namespaces: [(MDL_NAMESPACE.to_string(), elements)].into_iter().collect(),
            request_info: None,
        }
    }

    /// Builds the encoded `DeviceRequest` for this query, bound to the session transcript.
    ///
    /// Keys from the reader backend are marked used once the request is signed. When the
    /// configured identity was revoked the generic identity is used instead, and when no key
    /// can be had at all the request goes out without reader authentication.
    pub async fn generate_device_request(
        &self,
        method: &ReaderAuthMethod,
        encoded_session_transcript: &[u8],
        client: &ReaderBackendClient,
        intent_to_retain: bool,
    ) -> Result<GeneratedRequest, Error> {
        let session_transcript: Value = cbor::from_slice(encoded_session_transcript)?;
        let items_request = Tag24::new(self.items_request(intent_to_retain))
            .map_err(|e| CborError::EncodeFailed(e.to_string()))?;

        let reader_auth = match method {
            ReaderAuthMethod::NoReaderAuth => None,
            ReaderAuthMethod::CustomKey { key, chain } => Some(
                sign_reader_auth(
                    &items_request,
                    &session_transcript,
                    chain,
                    ReaderKey::Explicit(key),
                )
                .await?,
            ),
            _ => {
                let selector = method
                    .backend_selector()
                    .unwrap_or(ReaderIdentitySelector::Generic);
                let now = OffsetDateTime::now_utc();
                let (acquired, revoked) = acquire_key(client, selector, now).await;
                let reader_auth = match &acquired {
                    Some((selector, key_info, chain)) => {
                        let reader_auth = sign_reader_auth(
                            &items_request,
                            &session_transcript,
                            chain,
                            ReaderKey::SecureArea {
                                secure_area: client.secure_area().as_ref(),
                                alias: &key_info.alias,
                            },
                        )
                        .await?;
                        client.mark_key_as_used(key_info, selector, now).await?;
                        Some(reader_auth)
                    }
                    None => None,
                };
                return encode_request(items_request, reader_auth, revoked);
            }
        };
        encode_request(items_request, reader_auth, false)
    }
}

/// Gets a backend key for `selector`, falling back to the generic identity if `selector` was
/// revoked. Returns the key with the selector it was certified for, and whether the fallback
/// was taken.
async fn acquire_key(
    client: &ReaderBackendClient,
    selector: ReaderIdentitySelector,
    at: OffsetDateTime,
) -> (
    Option<(ReaderIdentitySelector, backend::KeyInfo, X5Chain)>,
    bool,
) {
    match client.get_key(&selector, at).await {
        Ok((key_info, chain)) => (Some((selector, key_info, chain)), false),
        Err(backend::Error::ReaderIdentityNotAvailable(_)) => {
            tracing::warn!(
                identity = %selector,
                "configured reader identity is no longer available, using the generic identity"
            );
            let generic = ReaderIdentitySelector::Generic;
            match client.get_key(&generic, at).await {
                Ok((key_info, chain)) => (Some((generic, key_info, chain)), true),
                Err(e) => {
                    tracing::error!(
                        "no certified reader key, proceeding without reader authentication: {e}"
                    );
                    (None, true)
                }
            }
        }
        Err(e) => {
            tracing::error!(
                "no certified reader key, proceeding without reader authentication: {e}"
            );
            (None, false)
        }
    }
}

/// Detached `COSE_Sign1` over `ReaderAuthenticationBytes`.
async fn sign_reader_auth(
    items_request: &Tag24<ItemsRequest>,
    session_transcript: &Value,
    chain: &X5Chain,
    key: ReaderKey<'_>,
) -> Result<Value, Error> {
    let reader_authentication = Value::Array(vec![
        Value::Text("ReaderAuthentication".into()),
        session_transcript.clone(),
        items_request.to_value(),
    ]);
    let reader_authentication_bytes = cbor::to_vec(&Value::Tag(
        24,
        Box::new(Value::Bytes(cbor::to_vec(&reader_authentication)?)),
    ))?;

    let protected = coset::HeaderBuilder::new()
        .algorithm(iana::Algorithm::ES256)
        .build();
    let unprotected = coset::HeaderBuilder::new()
        .value(X5CHAIN_COSE_HEADER_LABEL, chain.into_cbor())
        .build();
    let mut cose_sign1 = coset::CoseSign1Builder::new()
        .protected(protected)
        .unprotected(unprotected)
        .build();
    let to_be_signed = sig_structure_data(
        SignatureContext::CoseSign1,
        cose_sign1.protected.clone(),
        None,
        &[],
        &reader_authentication_bytes,
    );
    cose_sign1.signature = key.sign(&to_be_signed).await?.to_vec();

    cose_sign1
        .to_cbor_value()
        .map_err(|e| Error::Cbor(CborError::EncodeFailed(e.to_string())))
}

fn encode_request(
    items_request: Tag24<ItemsRequest>,
    reader_auth: Option<Value>,
    reader_identity_revoked: bool,
) -> Result<GeneratedRequest, Error> {
    let device_request = DeviceRequest {
        version: DeviceRequest::VERSION.into(),
        doc_requests: vec![DocRequest {
            items_request,
            reader_auth,
        }],
    };
    Ok(GeneratedRequest {
        encoded_device_request: cbor::to_vec(&device_request)?,
        reader_identity_revoked,
    })
}
