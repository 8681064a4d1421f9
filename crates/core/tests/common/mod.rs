#![allow(dead_code)]

use async_trait::async_trait;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use voicelink_core::{
    AudioCapture, CaptureTrack, ChannelEvent, ConnectRequest, Credential, CredentialProvider,
    LifecycleConfig, LifecycleController, NegotiatorConfig, PeerConnection, PeerConnector,
    SessionError, SessionNegotiator, SessionState, default_registry,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

/// Ordered record of everything the fakes observed.
#[derive(Default)]
pub struct Recorder {
    entries: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

pub struct FakeTrack {
    pub id: usize,
    enabled: AtomicBool,
    stopped: AtomicBool,
    recorder: Arc<Recorder>,
}

impl FakeTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl CaptureTrack for FakeTrack {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.recorder.record(format!("track-{}:stopped", self.id));
        }
    }
}

#[derive(Default)]
pub struct FakeCapture {
    pub recorder: Arc<Recorder>,
    pub deny: AtomicBool,
    /// Held before the device is granted, like a permission prompt.
    pub acquire_delay: Mutex<Duration>,
    pub tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeCapture {
    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn last_track(&self) -> Option<Arc<FakeTrack>> {
        self.tracks.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl AudioCapture for FakeCapture {
    async fn acquire(&self) -> Result<Arc<dyn CaptureTrack>, SessionError> {
        let delay = *self.acquire_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(SessionError::DeviceAccessDenied(
                "NotAllowedError: permission denied".into(),
            ));
        }
        let mut tracks = self.tracks.lock().unwrap();
        let track = Arc::new(FakeTrack {
            id: tracks.len() + 1,
            enabled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            recorder: self.recorder.clone(),
        });
        tracks.push(track.clone());
        let track: Arc<dyn CaptureTrack> = track;
        Ok(track)
    }
}

pub struct FakePeer {
    pub id: usize,
    recorder: Arc<Recorder>,
    ready_delay: Duration,
    inbound_tx: Mutex<Option<mpsc::Sender<String>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakePeer {
    /// Delivers a message as if it arrived on the data channel.
    pub async fn push(&self, message: impl Into<String>) {
        let tx = self.inbound_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            tx.send(message.into()).await.unwrap();
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<String, SessionError> {
        Ok(format!("v=0 offer-{}", self.id))
    }

    async fn apply_answer(&self, _answer: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn ready(&self) -> Result<(), SessionError> {
        tokio::time::sleep(self.ready_delay).await;
        self.recorder.record(format!("peer-{}:ready", self.id));
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<String>> {
        self.inbound_rx.lock().unwrap().take()
    }

    async fn send(&self, message: String) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Transport("data channel closed".into()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inbound_tx.lock().unwrap().take();
            self.recorder.record(format!("peer-{}:closed", self.id));
        }
    }
}

pub struct FakeConnector {
    pub recorder: Arc<Recorder>,
    pub ready_delay: Duration,
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeConnector {
    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().unwrap().last().cloned()
    }

    pub fn open_peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers().into_iter().filter(|p| !p.is_closed()).collect()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn open(
        &self,
        _capture: Arc<dyn CaptureTrack>,
    ) -> Result<Arc<dyn PeerConnection>, SessionError> {
        let (tx, rx) = mpsc::channel(32);
        let mut peers = self.peers.lock().unwrap();
        let peer = Arc::new(FakePeer {
            id: peers.len() + 1,
            recorder: self.recorder.clone(),
            ready_delay: self.ready_delay,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        peers.push(peer.clone());
        self.recorder.record(format!("peer-{}:opened", peer.id));
        let peer: Arc<dyn PeerConnection> = peer;
        Ok(peer)
    }
}

/// Issues credentials locally, echoing model and voice.
pub struct FakeCredentials {
    pub recorder: Arc<Recorder>,
    pub lifetime: Duration,
    pub issued: AtomicUsize,
    /// Requests numbered at or above this fail as unavailable; 0 never fails.
    pub fail_from: AtomicUsize,
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn request_credential(
        &self,
        request: &ConnectRequest,
    ) -> Result<Credential, SessionError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_from = self.fail_from.load(Ordering::SeqCst);
        if fail_from != 0 && n >= fail_from {
            self.recorder.record(format!("credential-{n}:failed"));
            return Err(SessionError::UpstreamUnavailable("sessions_failed".into()));
        }
        self.recorder.record(format!("credential-{n}:issued"));
        Ok(Credential::new(
            format!("ek_{n}"),
            request.model.clone(),
            request.voice.clone(),
            self.lifetime,
        ))
    }
}

impl FakeCredentials {
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

/// A controller wired to fakes and a mock realtime endpoint.
pub struct Fixture {
    pub server: MockServer,
    pub recorder: Arc<Recorder>,
    pub capture: Arc<FakeCapture>,
    pub connector: Arc<FakeConnector>,
    pub credentials: Arc<FakeCredentials>,
    pub controller: LifecycleController,
}

pub struct FixtureOptions {
    pub credential_lifetime: Duration,
    pub ready_delay: Duration,
    pub lifecycle: LifecycleConfig,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            credential_lifetime: Duration::from_secs(60),
            ready_delay: Duration::from_millis(5),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_options(FixtureOptions::default()).await
    }

    pub async fn with_options(options: FixtureOptions) -> Self {
        let recorder = Arc::new(Recorder::default());
        let credentials = Arc::new(FakeCredentials {
            recorder: recorder.clone(),
            lifetime: options.credential_lifetime,
            issued: AtomicUsize::new(0),
            fail_from: AtomicUsize::new(0),
        });
        Self::build(options, recorder, credentials.clone(), credentials).await
    }

    /// Uses `provider` for credentials; `credentials` stays unused.
    pub async fn with_provider(provider: Arc<dyn CredentialProvider>) -> Self {
        let options = FixtureOptions::default();
        let recorder = Arc::new(Recorder::default());
        let unused = Arc::new(FakeCredentials {
            recorder: recorder.clone(),
            lifetime: options.credential_lifetime,
            issued: AtomicUsize::new(0),
            fail_from: AtomicUsize::new(0),
        });
        Self::build(options, recorder, unused, provider).await
    }

    async fn build(
        options: FixtureOptions,
        recorder: Arc<Recorder>,
        credentials: Arc<FakeCredentials>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realtime"))
            .respond_with(ResponseTemplate::new(201).set_body_string("v=0 answer"))
            .mount(&server)
            .await;

        let capture = Arc::new(FakeCapture {
            recorder: recorder.clone(),
            ..FakeCapture::default()
        });
        let connector = Arc::new(FakeConnector {
            recorder: recorder.clone(),
            ready_delay: options.ready_delay,
            peers: Mutex::new(Vec::new()),
        });
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let negotiator = SessionNegotiator::new(provider, capture.clone(), connector.clone())
            .with_http_client(http)
            .with_config(NegotiatorConfig {
                realtime_url: format!("{}/realtime", server.uri()),
                handshake_timeout: Duration::from_secs(5),
            });
        let registry = Arc::new(default_registry().unwrap());
        let controller = LifecycleController::with_config(negotiator, registry, options.lifecycle);

        Self {
            server,
            recorder,
            capture,
            connector,
            credentials,
            controller,
        }
    }

    pub fn request(&self, model: &str, voice: &str) -> ConnectRequest {
        ConnectRequest::new("http://broker.invalid", model, voice)
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Records every value the controller's state watch publishes.
pub fn record_states(controller: &LifecycleController) -> Arc<Mutex<Vec<SessionState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let mut watch = controller.watch_state();
    let seen = states.clone();
    tokio::spawn(async move {
        seen.lock().unwrap().push(*watch.borrow_and_update());
        while watch.changed().await.is_ok() {
            seen.lock().unwrap().push(*watch.borrow_and_update());
        }
    });
    states
}

/// Drains the log lines currently queued on a subscription.
pub fn drain_logs(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ChannelEvent::Log(line) = event {
            lines.push(line);
        }
    }
    lines
}
