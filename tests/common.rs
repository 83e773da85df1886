#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use ciborium::Value as Cbor;
use coset::{AsCborValue, CoseSign1, Label};
use p256::ecdsa::{DerSignature, Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::JwkEcKey;
use p256::PublicKey;
use serde_json::{json, Value};
use signature::{Signer, Verifier};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::UtcTime;
use x509_cert::der::Encode;
use x509_cert::name::Name;
use x509_cert::spki::{SignatureBitStringEncoding, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

use identity_reader::backend::rpc::{decode_bytes, encode_bytes};
use identity_reader::backend::{
    Assertion, EphemeralStorage, ReaderBackendClient, RpcError, RpcStatus, RpcTransport,
    SoftwareAttestation, SoftwareDeviceCheck, SoftwareSecureArea, TrustEntry,
};
use identity_reader::cbor;
use identity_reader::config::ReaderBackendConfig;
use identity_reader::definitions::device_request::DeviceRequest;
use identity_reader::definitions::session::{self, Role};
use identity_reader::definitions::x509::{X5Chain, X5CHAIN_COSE_HEADER_LABEL};
use identity_reader::definitions::{
    CoseKey, DeviceEngagement, DeviceRetrievalMethod, EC2Curve, EphemeralSecretKey,
    SessionEncryption, SessionTranscript,
};
use identity_reader::presentation::reader::{
    ConnectionMethod, MdocTransport, MdocTransportFactory, TransportError, TransportOptions,
};

pub const USER_ID: &str = "1234567890";
pub const USER_EMAIL: &str = "user@example.org";
pub const NOT_SIGNED_IN: &str = "User isn't signed in";
pub const ALREADY_SIGNED_IN: &str = "User is already signed in";

fn utc(t: OffsetDateTime) -> Time {
    let secs = StdDuration::from_secs(t.unix_timestamp() as u64);
    Time::UtcTime(UtcTime::from_unix_duration(secs).unwrap())
}

/// A certificate authority of the loopback backend.
pub struct Authority {
    name: Name,
    key: SigningKey,
    pub certificate: Certificate,
}

impl Authority {
    pub fn new(common_name: &str) -> Self {
        let key = SigningKey::random(&mut rand::thread_rng());
        let name: Name = format!("CN={common_name}").parse().unwrap();
        let spki = SubjectPublicKeyInfoOwned::from_key(*key.verifying_key()).unwrap();
        let certificate = sign(
            CertificateBuilder::new(
                Profile::Manual {
                    issuer: Some(name.clone()),
                },
                rand::random::<u64>().into(),
                Validity {
                    not_before: utc(datetime!(2024-07-01 06:00 UTC)),
                    not_after: utc(datetime!(2030-07-01 06:00 UTC)),
                },
                name.clone(),
                spki,
                &key,
            )
            .unwrap(),
            &key,
        );
        Self {
            name,
            key,
            certificate,
        }
    }

    pub fn der(&self) -> Vec<u8> {
        self.certificate.to_der().unwrap()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    /// Chain of just this authority's own certificate.
    pub fn chain(&self) -> X5Chain {
        X5Chain::builder()
            .with_der_certificate(&self.der())
            .unwrap()
            .build()
            .unwrap()
    }

    /// Reader certificate for `public_key`, valid for 30 days give or take an hour.
    fn certify(&self, public_key: &PublicKey, now: OffsetDateTime) -> Certificate {
        let spki = SubjectPublicKeyInfoOwned::from_key(*public_key).unwrap();
        sign(
            CertificateBuilder::new(
                Profile::Manual {
                    issuer: Some(self.name.clone()),
                },
                rand::random::<u64>().into(),
                Validity {
                    not_before: utc(now - Duration::hours(1)),
                    not_after: utc(now + Duration::days(30) + Duration::hours(1)),
                },
                "CN=Reader Key".parse().unwrap(),
                spki,
                &self.key,
            )
            .unwrap(),
            &self.key,
        )
    }
}

fn sign(mut builder: CertificateBuilder<'_, SigningKey>, key: &SigningKey) -> Certificate {
    let signature: DerSignature = key.sign(&builder.finalize().unwrap());
    builder.assemble(signature.to_bitstring().unwrap()).unwrap()
}

pub struct FakeIdentity {
    pub id: String,
    pub display_name: String,
    pub display_icon: Vec<u8>,
    pub authority: Authority,
}

struct Registration {
    attestation: SoftwareAttestation,
    signed_in: bool,
}

#[derive(Default)]
struct ServerState {
    nonces: HashSet<Vec<u8>>,
    registrations: HashMap<String, Registration>,
}

type Failure = (RpcStatus, Value);

fn failure(status: RpcStatus, message: &str) -> Failure {
    (status, json!({ "error": message }))
}

fn bad_request(message: &str) -> Failure {
    failure(RpcStatus::Other(400), message)
}

fn string_field<'a>(request: &'a Value, name: &str) -> Result<&'a str, Failure> {
    request
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| bad_request(&format!("missing '{name}'")))
}

fn bytes_field(request: &Value, name: &str) -> Result<Vec<u8>, Failure> {
    decode_bytes(string_field(request, name)?).map_err(|_| bad_request(&format!("bad '{name}'")))
}

/// Reader backend answering RPCs in process, with a clock the test controls.
pub struct FakeBackend {
    reader_root: Authority,
    identities: Vec<FakeIdentity>,
    issuer_list: Option<(i64, Vec<TrustEntry>)>,
    state: Mutex<ServerState>,
    now: Mutex<OffsetDateTime>,
    num_rpc: AtomicUsize,
    disabled: AtomicBool,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            reader_root: Authority::new("TEST Reader Root"),
            identities: Vec::new(),
            issuer_list: None,
            state: Mutex::default(),
            now: Mutex::new(datetime!(2024-08-01 00:00 UTC)),
            num_rpc: AtomicUsize::new(0),
            disabled: AtomicBool::new(false),
        }
    }

    /// Grants signed-in users the reader identity `id`, issued by its own CA.
    pub fn with_identity(mut self, id: &str, display_name: &str, display_icon: &[u8]) -> Self {
        self.identities.push(FakeIdentity {
            id: id.into(),
            display_name: display_name.into(),
            display_icon: display_icon.to_vec(),
            authority: Authority::new(&format!("{display_name} Reader CA")),
        });
        self
    }

    pub fn with_issuer_list(mut self, version: i64, entries: Vec<TrustEntry>) -> Self {
        self.issuer_list = Some((version, entries));
        self
    }

    pub fn num_rpc(&self) -> usize {
        self.num_rpc.load(Ordering::SeqCst)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }

    pub fn set_now(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    /// Forgets every registration and outstanding nonce.
    pub fn reset_storage(&self) {
        *self.state.lock().unwrap() = ServerState::default();
    }

    pub fn reader_root_der(&self) -> Vec<u8> {
        self.reader_root.der()
    }

    pub fn identity_ca_der(&self, id: &str) -> Vec<u8> {
        self.identities
            .iter()
            .find(|identity| identity.id == id)
            .map(|identity| identity.authority.der())
            .unwrap()
    }

    fn get_nonce(&self, state: &mut ServerState) -> Value {
        let nonce = rand::random::<[u8; 16]>().to_vec();
        state.nonces.insert(nonce.clone());
        json!({ "nonce": encode_bytes(&nonce) })
    }

    fn take_nonce(state: &mut ServerState, nonce: &[u8]) -> Result<(), Failure> {
        if state.nonces.remove(nonce) {
            Ok(())
        } else {
            Err(bad_request("unknown nonce"))
        }
    }

    fn register(&self, state: &mut ServerState, request: &Value) -> Result<Value, Failure> {
        let nonce = bytes_field(request, "nonce")?;
        Self::take_nonce(state, &nonce)?;
        let attestation = SoftwareAttestation::decode(&bytes_field(request, "deviceAttestation")?)
            .map_err(|_| bad_request("malformed attestation"))?;
        if attestation.challenge != nonce {
            return Err(bad_request("attestation challenge mismatch"));
        }
        let registration_id = Uuid::new_v4().to_string();
        state.registrations.insert(
            registration_id.clone(),
            Registration {
                attestation,
                signed_in: false,
            },
        );
        Ok(json!({ "registrationId": registration_id }))
    }

    /// Checks the registration and the assertion over the request's nonce.
    fn authenticate(state: &mut ServerState, request: &Value) -> Result<(String, Vec<u8>), Failure> {
        let registration_id = string_field(request, "registrationId")?.to_owned();
        let nonce = bytes_field(request, "nonce")?;
        let assertion = bytes_field(request, "deviceAssertion")?;
        let registration = state
            .registrations
            .get(&registration_id)
            .ok_or_else(|| failure(RpcStatus::NotFound, "Unknown registration"))?;
        let asserted = registration
            .attestation
            .verify_assertion(&assertion)
            .map_err(|_| bad_request("invalid assertion"))?;
        if asserted != Assertion::Nonce(nonce.clone()) {
            return Err(bad_request("assertion is for another nonce"));
        }
        Self::take_nonce(state, &nonce)?;
        Ok((registration_id, nonce))
    }

    fn certify_keys(&self, state: &mut ServerState, request: &Value) -> Result<Value, Failure> {
        let (registration_id, _) = Self::authenticate(state, request)?;
        let signed_in = state.registrations[&registration_id].signed_in;
        let authority = match request.get("readerIdentity").and_then(Value::as_str) {
            None => &self.reader_root,
            Some(_) if !signed_in => return Err(failure(RpcStatus::Forbidden, NOT_SIGNED_IN)),
            Some("") => &self.reader_root,
            Some(id) => self
                .identities
                .iter()
                .find(|identity| identity.id == id)
                .map(|identity| &identity.authority)
                .ok_or_else(|| failure(RpcStatus::Forbidden, "Reader identity not available"))?,
        };

        let now = self.now();
        let certifications = request
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| bad_request("missing 'keys'"))?
            .iter()
            .map(|jwk| {
                let jwk: JwkEcKey =
                    serde_json::from_value(jwk.clone()).map_err(|_| bad_request("bad key"))?;
                let public_key = PublicKey::from_jwk(&jwk).map_err(|_| bad_request("bad key"))?;
                let leaf = authority.certify(&public_key, now);
                Ok(json!([
                    STANDARD.encode(leaf.to_der().unwrap()),
                    STANDARD.encode(authority.der()),
                ]))
            })
            .collect::<Result<Vec<_>, Failure>>()?;
        Ok(json!({ "readerCertifications": certifications }))
    }

    fn get_issuer_list(&self, state: &mut ServerState, request: &Value) -> Result<Value, Failure> {
        Self::authenticate(state, request)?;
        let current_version = request.get("currentVersion").and_then(Value::as_i64);
        Ok(match &self.issuer_list {
            Some((version, entries)) if current_version != Some(*version) => json!({
                "version": version,
                "entries": entries
                    .iter()
                    .map(|entry| encode_bytes(&entry.to_cbor().unwrap()))
                    .collect::<Vec<_>>(),
            }),
            _ => json!({}),
        })
    }

    fn sign_in(&self, state: &mut ServerState, request: &Value) -> Result<Value, Failure> {
        let (registration_id, nonce) = Self::authenticate(state, request)?;
        // The test identity provider issues the nonce itself as the ID token.
        if string_field(request, "googleIdTokenString")? != encode_bytes(&nonce) {
            return Err(bad_request("Invalid ID token"));
        }
        let registration = state
            .registrations
            .get_mut(&registration_id)
            .ok_or_else(|| failure(RpcStatus::NotFound, "Unknown registration"))?;
        if registration.signed_in {
            return Err(bad_request(ALREADY_SIGNED_IN));
        }
        registration.signed_in = true;
        Ok(json!({}))
    }

    fn sign_out(&self, state: &mut ServerState, request: &Value) -> Result<Value, Failure> {
        let (registration_id, _) = Self::authenticate(state, request)?;
        let registration = state
            .registrations
            .get_mut(&registration_id)
            .ok_or_else(|| failure(RpcStatus::NotFound, "Unknown registration"))?;
        if !registration.signed_in {
            return Err(bad_request(NOT_SIGNED_IN));
        }
        registration.signed_in = false;
        Ok(json!({}))
    }

    fn get_reader_identities(&self, state: &mut ServerState, request: &Value) -> Result<Value, Failure> {
        let (registration_id, _) = Self::authenticate(state, request)?;
        if !state.registrations[&registration_id].signed_in {
            return Err(bad_request(NOT_SIGNED_IN));
        }
        let entries: Vec<Value> = self
            .identities
            .iter()
            .map(|identity| {
                json!({
                    "id": identity.id,
                    "displayName": format!(
                        "{} id={USER_ID} email={USER_EMAIL}",
                        identity.display_name
                    ),
                    "displayIcon": encode_bytes(&identity.display_icon),
                })
            })
            .collect();
        Ok(json!({ "entries": entries }))
    }
}

#[async_trait]
impl RpcTransport for FakeBackend {
    async fn call(&self, method: &str, request: Value) -> Result<(RpcStatus, Value), RpcError> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(RpcError::new(method, "Server has been disabled"));
        }
        self.num_rpc.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        let reply = match method {
            "getNonce" => Ok(self.get_nonce(&mut state)),
            "register" => self.register(&mut state, &request),
            "certifyKeys" => self.certify_keys(&mut state, &request),
            "getIssuerList" => self.get_issuer_list(&mut state, &request),
            "signIn" => self.sign_in(&mut state, &request),
            "signOut" => self.sign_out(&mut state, &request),
            "getReaderIdentities" => self.get_reader_identities(&mut state, &request),
            _ => return Err(RpcError::new(method, format!("unexpected method {method}"))),
        };
        Ok(match reply {
            Ok(response) => (RpcStatus::Ok, response),
            Err(failure) => failure,
        })
    }
}

/// Client-side persistent state: survives building a new client, as across app restarts.
#[derive(Default)]
pub struct Device {
    pub storage: EphemeralStorage,
    pub secure_area: Arc<SoftwareSecureArea>,
}

impl Device {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, backend: Arc<FakeBackend>, num_keys: usize) -> ReaderBackendClient {
        ReaderBackendClient::new(
            ReaderBackendConfig::default().with_num_keys(num_keys),
            Arc::new(self.storage.clone()),
            backend,
            self.secure_area.clone(),
            Arc::new(SoftwareDeviceCheck::new(self.secure_area.clone())),
        )
    }
}

/// What the simulated holder does with the device request.
#[derive(Debug, Clone)]
pub enum HolderBehavior {
    /// Replies with `response` and, optionally, a status in the same message.
    Respond {
        response: Vec<u8>,
        status: Option<u64>,
    },
    /// Ends the session through the transport.
    EndSession,
    /// Never replies.
    Hang,
}

#[derive(Default)]
struct HolderSession {
    encryption: Option<SessionEncryption>,
    encoded_session_transcript: Option<Vec<u8>>,
    device_request: Option<Vec<u8>>,
    statuses: Vec<Option<u64>>,
    opened: bool,
    closed: bool,
}

fn failed(e: impl std::error::Error + Send + Sync + 'static) -> TransportError {
    TransportError::Failed(Box::new(e))
}

/// The holder end of a presentation, reached through an in-process transport.
pub struct SimulatedHolder {
    e_device_key: EphemeralSecretKey,
    pub engagement_bytes: Vec<u8>,
    handover: Cbor,
    behavior: HolderBehavior,
    connection_method: ConnectionMethod,
    session: Mutex<HolderSession>,
    replies: mpsc::UnboundedSender<Vec<u8>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    request_received: Notify,
    closed: Notify,
}

impl SimulatedHolder {
    pub fn new(
        methods: Vec<DeviceRetrievalMethod>,
        handover: Cbor,
        behavior: HolderBehavior,
    ) -> Arc<Self> {
        Self::on_curve(EC2Curve::P256, methods, handover, behavior)
    }

    /// A holder whose ephemeral device key is on `curve`.
    pub fn on_curve(
        curve: EC2Curve,
        methods: Vec<DeviceRetrievalMethod>,
        handover: Cbor,
        behavior: HolderBehavior,
    ) -> Arc<Self> {
        let e_device_key = EphemeralSecretKey::generate(curve).unwrap();
        let engagement = DeviceEngagement::new(e_device_key.public_key(), methods.clone()).unwrap();
        let connection_method = ConnectionMethod::disambiguate(&methods)
            .into_iter()
            .next()
            .unwrap_or_else(|| ConnectionMethod::ble_central_client(Uuid::new_v4()));
        let (replies, inbox) = mpsc::unbounded_channel();
        Arc::new(Self {
            e_device_key,
            engagement_bytes: cbor::to_vec(&engagement).unwrap(),
            handover,
            behavior,
            connection_method,
            session: Mutex::default(),
            replies,
            inbox: tokio::sync::Mutex::new(inbox),
            request_received: Notify::new(),
            closed: Notify::new(),
        })
    }

    /// The decrypted device request, once received.
    pub fn device_request(&self) -> Option<Vec<u8>> {
        self.session.lock().unwrap().device_request.clone()
    }

    pub fn encoded_session_transcript(&self) -> Option<Vec<u8>> {
        self.session.lock().unwrap().encoded_session_transcript.clone()
    }

    /// Statuses of the session messages the reader sent after the request.
    pub fn received_statuses(&self) -> Vec<Option<u64>> {
        self.session.lock().unwrap().statuses.clone()
    }

    pub fn is_open(&self) -> bool {
        let session = self.session.lock().unwrap();
        session.opened && !session.closed
    }

    pub fn is_closed(&self) -> bool {
        self.session.lock().unwrap().closed
    }

    pub async fn wait_for_request(&self) {
        if self.device_request().is_none() {
            self.request_received.notified().await;
        }
    }

    pub async fn wait_for_close(&self) {
        if !self.is_closed() {
            self.closed.notified().await;
        }
    }

    fn establish(&self, session: &mut HolderSession, message: &[u8]) -> Result<(), TransportError> {
        let e_reader_key = session::e_reader_key_from_establishment(message).map_err(failed)?;
        let transcript =
            SessionTranscript::new(self.engagement_bytes.clone(), &e_reader_key, self.handover.clone())
                .and_then(|transcript| transcript.encode())
                .map_err(failed)?;
        let mut encryption = SessionEncryption::new(
            Role::Mdoc,
            &self.e_device_key,
            &e_reader_key,
            &e_reader_key,
            &transcript,
        )
        .map_err(failed)?;
        let (device_request, _) = encryption.decrypt_message(message).map_err(failed)?;

        let reply = match &self.behavior {
            HolderBehavior::Respond { response, status } => Some(
                encryption
                    .encrypt_message(Some(response), *status)
                    .map_err(failed)?,
            ),
            HolderBehavior::EndSession => Some(Vec::new()),
            HolderBehavior::Hang => None,
        };
        session.encryption = Some(encryption);
        session.encoded_session_transcript = Some(transcript);
        session.device_request = device_request;
        if let Some(reply) = reply {
            self.replies.send(reply).map_err(|_| TransportError::Closed)?;
        }
        self.request_received.notify_one();
        Ok(())
    }
}

#[async_trait]
impl MdocTransport for SimulatedHolder {
    fn connection_method(&self) -> ConnectionMethod {
        self.connection_method.clone()
    }

    async fn open(&self, e_device_key: &CoseKey) -> Result<(), TransportError> {
        let mut session = self.session.lock().unwrap();
        if session.closed {
            return Err(TransportError::Closed);
        }
        assert_eq!(e_device_key, &self.e_device_key.public_key());
        session.opened = true;
        Ok(())
    }

    async fn send_message(&self, message: &[u8]) -> Result<(), TransportError> {
        let mut session = self.session.lock().unwrap();
        if !session.opened || session.closed {
            return Err(TransportError::Closed);
        }
        match session.encryption.as_mut() {
            None => self.establish(&mut session, message),
            Some(encryption) => {
                let (_, status) = encryption.decrypt_message(message).map_err(failed)?;
                session.statuses.push(status);
                Ok(())
            }
        }
    }

    async fn wait_for_message(&self) -> Result<Vec<u8>, TransportError> {
        self.inbox.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) {
        self.session.lock().unwrap().closed = true;
        self.closed.notify_one();
    }

    fn scanning_time(&self) -> Option<StdDuration> {
        match self.connection_method {
            ConnectionMethod::Ble(_) => Some(StdDuration::from_millis(250)),
            _ => None,
        }
    }
}

/// Hands out a single simulated holder and remembers what it was asked for.
pub struct HolderFactory {
    holder: Arc<SimulatedHolder>,
    pub requested: Mutex<VecDeque<(ConnectionMethod, Role, TransportOptions)>>,
}

impl HolderFactory {
    pub fn new(holder: Arc<SimulatedHolder>) -> Arc<Self> {
        Arc::new(Self {
            holder,
            requested: Mutex::default(),
        })
    }
}

impl MdocTransportFactory for HolderFactory {
    fn create_transport(
        &self,
        connection_method: &ConnectionMethod,
        role: Role,
        options: &TransportOptions,
    ) -> Result<Arc<dyn MdocTransport>, TransportError> {
        self.requested
            .lock()
            .unwrap()
            .push_back((connection_method.clone(), role, options.clone()));
        Ok(self.holder.clone())
    }
}

/// Checks the detached reader authentication of the single document request in
/// `encoded_device_request` against `encoded_session_transcript`, and returns its chain.
///
/// Returns `None` when the request is not authenticated.
pub fn verify_reader_auth(
    encoded_device_request: &[u8],
    encoded_session_transcript: &[u8],
) -> Option<X5Chain> {
    let device_request: DeviceRequest = cbor::from_slice(encoded_device_request).unwrap();
    assert_eq!(device_request.version, DeviceRequest::VERSION);
    let doc_request = &device_request.doc_requests[0];
    let reader_auth = CoseSign1::from_cbor_value(doc_request.reader_auth.clone()?).unwrap();
    assert!(reader_auth.payload.is_none());

    let x5chain = reader_auth
        .unprotected
        .rest
        .iter()
        .find(|(label, _)| *label == Label::Int(X5CHAIN_COSE_HEADER_LABEL))
        .map(|(_, value)| value.clone())
        .unwrap();
    let chain = X5Chain::from_cbor(x5chain).unwrap();

    let session_transcript: Cbor = cbor::from_slice(encoded_session_transcript).unwrap();
    let reader_authentication = Cbor::Array(vec![
        Cbor::Text("ReaderAuthentication".into()),
        session_transcript,
        doc_request.items_request.to_value(),
    ]);
    let reader_authentication_bytes = cbor::to_vec(&Cbor::Tag(
        24,
        Box::new(Cbor::Bytes(cbor::to_vec(&reader_authentication).unwrap())),
    ))
    .unwrap();

    let verifier = VerifyingKey::from(&chain.end_entity_public_key().unwrap());
    reader_auth
        .verify_detached_signature(&reader_authentication_bytes, &[], |signature, data| {
            verifier.verify(data, &Signature::from_slice(signature)?)
        })
        .unwrap();
    Some(chain)
}
