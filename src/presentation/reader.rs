//! Reader side of a single mdoc presentation.
//!
//! [ReaderModel] walks through engagement, request and the encrypted exchange with the holder:
//!
//! ```text
//! Idle -> WaitingForDeviceRequest -> WaitingForStart -> Connecting -> Completed
//! ```
//!
//! [ReaderModel::reset] returns to `Idle` from any state and cancels an exchange in flight.
//! The exchange runs on a caller supplied tokio runtime; its outcome is read through
//! [ReaderModel::result] and [ReaderModel::error] once the state is `Completed`.
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ciborium::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend;
use crate::backend::secure_area::SecureAreaError;
use crate::cbor::{self, CborError};
use crate::definitions::device_engagement;
use crate::definitions::session::{self, Role, STATUS_SESSION_TERMINATION};
use crate::definitions::{
    DeviceEngagement, EC2Curve, EphemeralSecretKey, SessionEncryption, SessionTranscript,
};

pub use transport::{
    ConnectionMethod, MdocTransport, MdocTransportFactory, TransportError, TransportOptions,
};

pub mod query;
pub mod transport;

/// How long observers get to see `Completed` before the exchange's cancellation token fires.
const COMPLETION_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    WaitingForDeviceRequest,
    WaitingForStart,
    Connecting,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementType {
    Qr,
    NfcStaticHandover,
    NfcNegotiatedHandover,
}

impl EngagementType {
    /// QR engagement has a `null` handover; NFC static handover has no handover request.
    pub fn from_handover(handover: &Value) -> Self {
        match handover {
            Value::Null => EngagementType::Qr,
            Value::Array(items) if matches!(items.get(1), Some(Value::Null)) => {
                EngagementType::NfcStaticHandover
            }
            _ => EngagementType::NfcNegotiatedHandover,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            EngagementType::Qr => "QR code",
            EngagementType::NfcStaticHandover => "NFC Static Handover",
            EngagementType::NfcNegotiatedHandover => "NFC Negotiated Handover",
        }
    }
}

/// Outcome of a completed exchange.
#[derive(Debug, Clone)]
pub struct ReaderModelResult {
    /// Status the holder sent, `None` if it ended the session through the transport.
    pub status: Option<u64>,
    pub encoded_device_response: Option<Vec<u8>>,
    pub encoded_session_transcript: Vec<u8>,
    pub e_reader_key: EphemeralSecretKey,
    pub engagement_type: EngagementType,
    pub duration_engagement_received_to_request_sent: Duration,
    pub duration_request_sent_to_response_received: Duration,
    pub duration_scanning_time: Option<Duration>,
    pub connection_method: ConnectionMethod,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: State,
    },
    #[error("invalid device engagement: {0}")]
    Engagement(#[from] device_engagement::Error),
    #[error("holder's ephemeral key is on {0:?}, which is not supported")]
    UnsupportedCurve(EC2Curve),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    SessionEncryption(#[from] session::Error),
    #[error(transparent)]
    Cbor(#[from] CborError),
    #[error("the device engagement offers no usable connection method")]
    NoConnectionMethod,
    #[error("the exchange was cancelled")]
    Cancelled,
    #[error("failed to sign the request: {0}")]
    ReaderAuth(#[from] SecureAreaError),
    #[error(transparent)]
    Backend(#[from] backend::Error),
}

/// Everything the model holds for the current presentation.
#[derive(Default)]
struct Session {
    /// Bumped on every reset so a finishing exchange can tell it has been abandoned.
    generation: u64,
    engagement: Option<DeviceEngagement>,
    handover: Option<Value>,
    existing_transport: Option<Arc<dyn MdocTransport>>,
    e_reader_key: Option<EphemeralSecretKey>,
    encoded_session_transcript: Option<Vec<u8>>,
    encoded_device_request: Option<Vec<u8>>,
    transport_options: Option<TransportOptions>,
    cancellation: Option<CancellationToken>,
    result: Option<ReaderModelResult>,
    error: Option<Arc<Error>>,
}

impl Session {
    fn clear_transient(&mut self) {
        self.engagement = None;
        self.handover = None;
        self.existing_transport = None;
        self.e_reader_key = None;
        self.encoded_device_request = None;
    }
}

pub struct ReaderModel {
    factory: Arc<dyn MdocTransportFactory>,
    session: Arc<Mutex<Session>>,
    state: Arc<watch::Sender<State>>,
}

impl ReaderModel {
    /// `factory` creates the transport when the caller does not supply a connected one.
    pub fn new(factory: Arc<dyn MdocTransportFactory>) -> Self {
        let (state, _) = watch::channel(State::Idle);
        Self {
            factory,
            session: Arc::default(),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    pub fn set_transport_options(&self, options: TransportOptions) {
        lock(&self.session).transport_options = Some(options);
    }

    /// Takes the holder's engagement and prepares the session transcript for the request.
    ///
    /// `handover` is CBOR `null` for QR engagement. An `existing_transport` is used as is instead
    /// of connecting through one of the engagement's connection methods.
    pub fn set_connection_endpoint(
        &self,
        engagement_bytes: Vec<u8>,
        handover: Value,
        existing_transport: Option<Arc<dyn MdocTransport>>,
    ) -> Result<(), Error> {
        let mut session = lock(&self.session);
        self.expect_state("set the connection endpoint", State::Idle)?;

        let engagement: DeviceEngagement = cbor::from_slice(&engagement_bytes)?;
        let curve = engagement.e_device_key().curve();
        let e_reader_key =
            EphemeralSecretKey::generate(curve).map_err(|_| Error::UnsupportedCurve(curve))?;
        let encoded_session_transcript = SessionTranscript::new(
            engagement_bytes,
            &e_reader_key.public_key(),
            handover.clone(),
        )?
        .encode()?;
        tracing::debug!(
            transcript_len = encoded_session_transcript.len(),
            "computed session transcript"
        );

        session.engagement = Some(engagement);
        session.handover = Some(handover);
        session.existing_transport = existing_transport;
        session.e_reader_key = Some(e_reader_key);
        session.encoded_session_transcript = Some(encoded_session_transcript);
        self.state.send_replace(State::WaitingForDeviceRequest);
        Ok(())
    }

    /// `encoded_device_request` must have been built over [Self::encoded_session_transcript].
    pub fn set_device_request(&self, encoded_device_request: Vec<u8>) -> Result<(), Error> {
        let mut session = lock(&self.session);
        self.expect_state("set the device request", State::WaitingForDeviceRequest)?;
        session.encoded_device_request = Some(encoded_device_request);
        self.state.send_replace(State::WaitingForStart);
        Ok(())
    }

    /// Runs the exchange on `runtime`.
    ///
    /// Failures of the exchange itself do not surface here; they are available from
    /// [Self::error] once the state is `Completed`.
    pub fn start(&self, runtime: &Handle) -> Result<(), Error> {
        let mut session = lock(&self.session);
        self.expect_state("start", State::WaitingForStart)?;

        let missing = || Error::InvalidState {
            operation: "start",
            state: State::WaitingForStart,
        };
        let exchange = Exchange {
            engagement: session.engagement.clone().ok_or_else(missing)?,
            handover: session.handover.clone().ok_or_else(missing)?,
            existing_transport: session.existing_transport.clone(),
            e_reader_key: session.e_reader_key.clone().ok_or_else(missing)?,
            encoded_session_transcript: session
                .encoded_session_transcript
                .clone()
                .ok_or_else(missing)?,
            encoded_device_request: session.encoded_device_request.clone().ok_or_else(missing)?,
            options: session.transport_options.clone().unwrap_or_default(),
        };

        let cancellation = CancellationToken::new();
        session.cancellation = Some(cancellation.clone());
        let generation = session.generation;
        self.state.send_replace(State::Connecting);
        drop(session);

        let shared = self.session.clone();
        let state = self.state.clone();
        let factory = self.factory.clone();
        runtime.spawn(async move {
            let outcome = exchange.run(factory.as_ref(), &cancellation).await;
            {
                let mut session = lock(&shared);
                if session.generation != generation {
                    return;
                }
                match outcome {
                    Ok(result) => session.result = Some(result),
                    Err(e) => {
                        tracing::warn!("reader exchange failed: {e}");
                        session.error = Some(Arc::new(e));
                    }
                }
                session.clear_transient();
                state.send_replace(State::Completed);
            }

            tokio::select! {
                _ = tokio::time::sleep(COMPLETION_GRACE) => {}
                _ = cancellation.cancelled() => {}
            }
            cancellation.cancel();
            let mut session = lock(&shared);
            if session.generation == generation {
                session.cancellation = None;
            }
        });
        Ok(())
    }

    /// Cancels any exchange in flight and forgets the current presentation.
    pub fn reset(&self) {
        let mut session = lock(&self.session);
        if let Some(cancellation) = session.cancellation.take() {
            cancellation.cancel();
        }
        let generation = session.generation + 1;
        *session = Session {
            generation,
            ..Session::default()
        };
        self.state.send_replace(State::Idle);
    }

    pub fn encoded_session_transcript(&self) -> Result<Vec<u8>, Error> {
        let session = lock(&self.session);
        self.expect_active("read the session transcript")?;
        session
            .encoded_session_transcript
            .clone()
            .ok_or(Error::InvalidState {
                operation: "read the session transcript",
                state: self.state(),
            })
    }

    pub fn e_reader_key(&self) -> Result<EphemeralSecretKey, Error> {
        let session = lock(&self.session);
        self.expect_active("read the reader key")?;
        session.e_reader_key.clone().ok_or(Error::InvalidState {
            operation: "read the reader key",
            state: self.state(),
        })
    }

    /// Token cancelled when the exchange is reset, or shortly after it completes. Work tied to
    /// the presentation can select on it.
    pub fn cancellation_token(&self) -> Result<CancellationToken, Error> {
        let session = lock(&self.session);
        self.expect_active("access the cancellation token")?;
        session.cancellation.clone().ok_or(Error::InvalidState {
            operation: "access the cancellation token",
            state: self.state(),
        })
    }

    pub fn result(&self) -> Option<ReaderModelResult> {
        lock(&self.session).result.clone()
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        lock(&self.session).error.clone()
    }

    fn expect_state(&self, operation: &'static str, expected: State) -> Result<(), Error> {
        let state = self.state();
        if state != expected {
            return Err(Error::InvalidState { operation, state });
        }
        Ok(())
    }

    fn expect_active(&self, operation: &'static str) -> Result<(), Error> {
        match self.state() {
            state @ (State::Idle | State::Completed) => Err(Error::InvalidState { operation, state }),
            _ => Ok(()),
        }
    }
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Inputs of one exchange, detached from the model so it can run on another task.
struct Exchange {
    engagement: DeviceEngagement,
    handover: Value,
    existing_transport: Option<Arc<dyn MdocTransport>>,
    e_reader_key: EphemeralSecretKey,
    encoded_session_transcript: Vec<u8>,
    encoded_device_request: Vec<u8>,
    options: TransportOptions,
}

impl Exchange {
    async fn run(
        self,
        factory: &dyn MdocTransportFactory,
        cancellation: &CancellationToken,
    ) -> Result<ReaderModelResult, Error> {
        let engagement_received = Instant::now();

        let transport = match self.existing_transport.clone() {
            Some(transport) => transport,
            None => {
                let connection_method =
                    ConnectionMethod::disambiguate(&self.engagement.device_retrieval_methods)
                        .into_iter()
                        .next()
                        .ok_or(Error::NoConnectionMethod)?;
                factory.create_transport(&connection_method, Role::MdocReader, &self.options)?
            }
        };

        let outcome = self
            .converse(transport.as_ref(), engagement_received, cancellation)
            .await;
        transport.close().await;
        outcome
    }

    async fn converse(
        self,
        transport: &dyn MdocTransport,
        engagement_received: Instant,
        cancellation: &CancellationToken,
    ) -> Result<ReaderModelResult, Error> {
        let engagement_type = EngagementType::from_handover(&self.handover);
        tracing::debug!(engagement = engagement_type.description(), "starting exchange");

        let e_device_key = self.engagement.e_device_key();
        let mut encryption = SessionEncryption::new(
            Role::MdocReader,
            &self.e_reader_key,
            e_device_key,
            &self.e_reader_key.public_key(),
            &self.encoded_session_transcript,
        )?;
        let connection_method = transport.connection_method();

        cancellable(cancellation, transport.open(e_device_key)).await?;
        let request = encryption.encrypt_message(Some(&self.encoded_device_request), None)?;
        cancellable(cancellation, transport.send_message(&request)).await?;
        let request_sent = Instant::now();

        let message = cancellable(cancellation, transport.wait_for_message()).await?;
        let response_received = Instant::now();

        let (encoded_device_response, status) = if message.is_empty() {
            tracing::info!("holder ended the session through the transport");
            (None, None)
        } else {
            let (response, status) = encryption.decrypt_message(&message)?;
            tracing::info!(
                bytes = response.as_ref().map(Vec::len),
                status,
                "received response from holder"
            );
            if status != Some(STATUS_SESSION_TERMINATION) {
                let termination = session::encode_status(STATUS_SESSION_TERMINATION)?;
                cancellable(cancellation, transport.send_message(&termination)).await?;
            }
            (response, status)
        };

        Ok(ReaderModelResult {
            status,
            encoded_device_response,
            encoded_session_transcript: self.encoded_session_transcript,
            e_reader_key: self.e_reader_key,
            engagement_type,
            duration_engagement_received_to_request_sent: request_sent - engagement_received,
            duration_request_sent_to_response_received: response_received - request_sent,
            duration_scanning_time: transport.scanning_time(),
            connection_method,
        })
    }
}

async fn cancellable<T, E>(
    cancellation: &CancellationToken,
    operation: impl Future<Output = Result<T, E>>,
) -> Result<T, Error>
where
    Error: From<E>,
{
    tokio::select! {
        result = operation => Ok(result?),
        _ = cancellation.cancelled() => Err(Error::Cancelled),
    }
}
