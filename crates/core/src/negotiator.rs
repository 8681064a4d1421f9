//! Transport Negotiation
//!
//! Turns a `ConnectRequest` into a live [`RealtimeSession`]: capture the
//! microphone, fetch an ephemeral credential, exchange session descriptions
//! with the realtime endpoint and wait for the transport to come up.
//!
//! The media stack itself is a collaborator. Embedders plug in a concrete
//! capture device and peer connection through [`AudioCapture`] and
//! [`PeerConnector`]; this module owns the ordering, the timeouts and the
//! guarantee that nothing acquired along the way outlives a failed attempt.

use crate::{
    credential::{self, ConnectRequest, Credential, CredentialProvider},
    error::SessionError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fmt,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_REALTIME_URL: &str = "https://api.openai.com/v1/realtime";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Lifecycle of one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Requesting,
    Negotiating,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Requesting => "requesting",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Receives state transitions as they happen.
pub type StateReporter = Arc<dyn Fn(SessionState) + Send + Sync>;

/// A live local capture track (the microphone).
pub trait CaptureTrack: Send + Sync {
    /// Gates the track without renegotiating the transport.
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Releases the device. Must be idempotent.
    fn stop(&self);
}

/// Grants access to the local microphone.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Fails with `SessionError::DeviceAccessDenied` when access is refused.
    async fn acquire(&self) -> Result<Arc<dyn CaptureTrack>, SessionError>;
}

/// One peer connection carrying audio and the JSON data channel.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Local session description (SDP offer).
    async fn create_offer(&self) -> Result<String, SessionError>;
    /// Applies the remote session description (SDP answer).
    async fn apply_answer(&self, answer: &str) -> Result<(), SessionError>;
    /// Resolves once the transport reports it is ready to carry media and events.
    async fn ready(&self) -> Result<(), SessionError>;
    /// Inbound data-channel messages, in arrival order. Yields `Some` once.
    fn take_inbound(&self) -> Option<mpsc::Receiver<String>>;
    async fn send(&self, message: String) -> Result<(), SessionError>;
    /// Tears down the connection. Must be idempotent.
    async fn close(&self);
}

/// Creates peer connections bound to a capture track.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(&self, capture: Arc<dyn CaptureTrack>)
    -> Result<Arc<dyn PeerConnection>, SessionError>;
}

/// Tunables for the handshake.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Realtime endpoint receiving the SDP offer; `?model=` is appended.
    pub realtime_url: String,
    /// Upper bound on the credential request, and separately on the
    /// offer/answer exchange plus transport readiness.
    pub handshake_timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Performs the credential + offer/answer handshake.
#[derive(Clone)]
pub struct SessionNegotiator {
    credentials: Arc<dyn CredentialProvider>,
    capture: Arc<dyn AudioCapture>,
    connector: Arc<dyn PeerConnector>,
    http: reqwest::Client,
    config: NegotiatorConfig,
}

impl SessionNegotiator {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        capture: Arc<dyn AudioCapture>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        Self {
            credentials,
            capture,
            connector,
            http: reqwest::Client::new(),
            config: NegotiatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: NegotiatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Convenience wrapper without cancellation or state reporting.
    pub async fn connect(&self, request: &ConnectRequest) -> Result<RealtimeSession, SessionError> {
        self.negotiate(request, &CancellationToken::new(), Arc::new(|_| {}))
            .await
    }

    /// Runs the full handshake.
    ///
    /// Any failure, including cancellation through `cancel`, releases the
    /// capture track and the peer connection before returning, and reports
    /// `Failed` followed by `Idle`. A device failure leaves the state at `Idle`.
    pub async fn negotiate(
        &self,
        request: &ConnectRequest,
        cancel: &CancellationToken,
        report: StateReporter,
    ) -> Result<RealtimeSession, SessionError> {
        let capture = self.capture.acquire().await.inspect_err(|e| {
            warn!(error = %e, "Audio capture unavailable");
        })?;

        report(SessionState::Requesting);
        let timeout = self.config.handshake_timeout;
        let requested = async {
            tokio::time::timeout(timeout, self.credentials.request_credential(request))
                .await
                .unwrap_or_else(|_| {
                    Err(SessionError::UpstreamUnavailable(format!(
                        "credential request timed out after {timeout:?}"
                    )))
                })
        };
        let credential = match until_cancelled(cancel, requested).await {
            Ok(credential) => credential,
            Err(e) => return Err(abandon(e, &capture, None, &report).await),
        };
        debug!(model = %credential.model, voice = %credential.voice, expires_at = %credential.expires_at, "Credential issued");

        report(SessionState::Negotiating);
        let peer = match until_cancelled(cancel, self.connector.open(Arc::clone(&capture))).await {
            Ok(peer) => peer,
            Err(e) => return Err(abandon(e, &capture, None, &report).await),
        };

        let handshake = async {
            tokio::time::timeout(timeout, self.handshake(peer.as_ref(), &credential))
                .await
                .unwrap_or_else(|_| Err(SessionError::handshake_timeout(timeout)))
        };
        if let Err(e) = until_cancelled(cancel, handshake).await {
            return Err(abandon(e, &capture, Some(&peer), &report).await);
        }

        report(SessionState::Connected);
        info!(model = %credential.model, voice = %credential.voice, "Transport connected");
        Ok(RealtimeSession::new(credential, capture, peer, report))
    }

    async fn handshake(&self, peer: &dyn PeerConnection, credential: &Credential) -> Result<(), SessionError> {
        let offer = peer.create_offer().await?;
        let answer = self.exchange(&offer, credential).await?;
        peer.apply_answer(&answer).await?;
        peer.ready().await
    }

    /// Posts the SDP offer and returns the SDP answer.
    async fn exchange(&self, offer: &str, credential: &Credential) -> Result<String, SessionError> {
        let response = self
            .http
            .post(&self.config.realtime_url)
            .query(&[("model", credential.model.as_str())])
            .header(reqwest::header::AUTHORIZATION, credential::bearer(credential))
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .header("OpenAI-Beta", "realtime=v1")
            .body(offer.to_string())
            .send()
            .await
            .map_err(|e| SessionError::NegotiationFailure {
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SessionError::NegotiationFailure {
                status: Some(status.as_u16()),
                body: e.to_string(),
            })?;
        if !status.is_success() {
            return Err(SessionError::NegotiationFailure {
                status: Some(status.as_u16()),
                body,
            });
        }
        Ok(body)
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Superseded),
        result = fut => result,
    }
}

/// Releases everything a failed attempt acquired.
async fn abandon(
    error: SessionError,
    capture: &Arc<dyn CaptureTrack>,
    peer: Option<&Arc<dyn PeerConnection>>,
    report: &StateReporter,
) -> SessionError {
    if let Some(peer) = peer {
        peer.close().await;
    }
    capture.stop();
    if error != SessionError::Superseded {
        warn!(error = %error, "Negotiation failed");
    }
    report(SessionState::Failed);
    report(SessionState::Idle);
    error
}

/// A negotiated, live session.
pub struct RealtimeSession {
    id: Uuid,
    credential: Credential,
    connected_at: DateTime<Utc>,
    capture: Arc<dyn CaptureTrack>,
    peer: Arc<dyn PeerConnection>,
    report: StateReporter,
    closed: AtomicBool,
    state: Mutex<SessionState>,
}

impl RealtimeSession {
    fn new(
        credential: Credential,
        capture: Arc<dyn CaptureTrack>,
        peer: Arc<dyn PeerConnection>,
        report: StateReporter,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            credential,
            connected_at: Utc::now(),
            capture,
            peer,
            report,
            closed: AtomicBool::new(false),
            state: Mutex::new(SessionState::Connected),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.credential.model
    }

    pub fn voice(&self) -> &str {
        &self.credential.voice
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.credential.expires_at
    }

    pub fn credential_lifetime(&self) -> Duration {
        self.credential.lifetime()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    pub fn enable_mic(&self, enabled: bool) {
        self.capture.set_enabled(enabled);
    }

    pub fn mic_enabled(&self) -> bool {
        self.capture.is_enabled()
    }

    pub async fn send(&self, message: String) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::NotConnected);
        }
        self.peer.send(message).await
    }

    fn transition(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = next;
        (self.report)(next);
    }

    /// Releases the capture device and the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transition(SessionState::Closing);
        self.capture.stop();
        self.peer.close().await;
        self.transition(SessionState::Closed);
        info!(session_id = %self.id, "Session closed");
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.capture.stop();
        let peer = Arc::clone(&self.peer);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { peer.close().await });
        }
    }
}

impl fmt::Debug for RealtimeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSession")
            .field("id", &self.id)
            .field("model", &self.credential.model)
            .field("voice", &self.credential.voice)
            .field("state", &self.state())
            .finish()
    }
}
