//! Session Lifecycle
//!
//! [`LifecycleController`] owns the one active [`RealtimeSession`] a client
//! may hold. It supersedes in-flight negotiations when a newer connect
//! arrives, pumps inbound events through an [`EventChannel`], answers tool
//! calls, gates the microphone and refreshes the credential before it
//! expires.
//!
//! Every connect attempt is stamped with a generation number. Only the attempt
//! whose generation is still current may install itself; state reports from
//! stale attempts are discarded.

use crate::{
    credential::ConnectRequest,
    error::SessionError,
    events::{ChannelEvent, EventChannel, EventHub},
    negotiator::{RealtimeSession, SessionNegotiator, SessionState, StateReporter},
    tools::{ToolDefinition, ToolInvocationBridge, ToolRegistry},
};
use chrono::{SecondsFormat, Utc};
use futures::{FutureExt, future::BoxFuture};
use serde_json::{Value, json};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_INSTRUCTIONS: &str = "You are a fast, friendly voice agent. Keep answers concise. \
When asked for the current time, call the getTime tool with 'America/Los_Angeles' unless a timezone is given.";

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long before credential expiry the refresh fires.
    pub refresh_margin: Duration,
    /// Lower bound on the refresh delay, for very short-lived credentials.
    pub min_refresh_interval: Duration,
    /// Sent to the remote peer in `session.update` after every connect.
    pub instructions: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
        }
    }
}

impl LifecycleConfig {
    pub fn refresh_delay(&self, lifetime: Duration) -> Duration {
        lifetime
            .saturating_sub(self.refresh_margin)
            .max(self.min_refresh_interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectReason {
    User,
    Refresh { generation: u64 },
}

struct Active {
    session: Arc<RealtimeSession>,
    pump: JoinHandle<()>,
}

impl Active {
    async fn shutdown(self) {
        self.pump.abort();
        self.session.close().await;
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct RefreshTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    active: Option<Active>,
    connecting: Option<CancellationToken>,
    refresh: Option<RefreshTimer>,
    mic_enabled: bool,
    last_request: Option<ConnectRequest>,
}

impl Inner {
    fn cancel_refresh(&mut self) {
        if let Some(timer) = self.refresh.take() {
            timer.cancel.cancel();
            timer.handle.abort();
        }
    }

    fn cancel_connect(&mut self) {
        if let Some(token) = self.connecting.take() {
            token.cancel();
        }
    }
}

struct Shared {
    negotiator: SessionNegotiator,
    bridge: ToolInvocationBridge,
    hub: EventHub,
    config: LifecycleConfig,
    generation: AtomicU64,
    state: watch::Sender<SessionState>,
    inner: Mutex<Inner>,
}

/// Owns the single active session of one client.
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct LifecycleController {
    shared: Arc<Shared>,
}

impl LifecycleController {
    pub fn new(negotiator: SessionNegotiator, registry: Arc<ToolRegistry>) -> Self {
        Self::with_config(negotiator, registry, LifecycleConfig::default())
    }

    pub fn with_config(
        negotiator: SessionNegotiator,
        registry: Arc<ToolRegistry>,
        config: LifecycleConfig,
    ) -> Self {
        let hub = EventHub::new();
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                negotiator,
                bridge: ToolInvocationBridge::new(registry, hub.clone()),
                hub,
                config,
                generation: AtomicU64::new(0),
                state,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn hub(&self) -> &EventHub {
        &self.shared.hub
    }

    /// Transcripts, diagnostics, tool activity and log lines, in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.shared.hub.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub async fn mic_enabled(&self) -> bool {
        self.shared.inner.lock().await.mic_enabled
    }

    pub async fn has_pending_refresh(&self) -> bool {
        self.shared
            .inner
            .lock()
            .await
            .refresh
            .as_ref()
            .is_some_and(|timer| !timer.handle.is_finished())
    }

    pub async fn current_session(&self) -> Option<Arc<RealtimeSession>> {
        self.shared
            .inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| Arc::clone(&active.session))
    }

    /// Connects, replacing any active session and superseding any connect
    /// still in flight. The microphone starts enabled.
    pub async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<Arc<RealtimeSession>, SessionError> {
        self.shared.connect(request, true, ConnectReason::User).await
    }

    /// Closes the current session and connects again with the last request.
    pub async fn reconnect(&self) -> Result<Arc<RealtimeSession>, SessionError> {
        let request = self
            .shared
            .inner
            .lock()
            .await
            .last_request
            .clone()
            .ok_or(SessionError::NotConnected)?;
        self.connect(request).await
    }

    /// Flips the microphone. Without an active session this connects using
    /// `request` instead. Returns the new enablement.
    pub async fn toggle_mic(&self, request: &ConnectRequest) -> Result<bool, SessionError> {
        {
            let mut guard = self.shared.inner.lock().await;
            let inner = &mut *guard;
            if let Some(active) = &inner.active {
                let next = !inner.mic_enabled;
                active.session.enable_mic(next);
                inner.mic_enabled = next;
                info!(enabled = next, "Microphone toggled");
                return Ok(next);
            }
        }
        self.connect(request.clone()).await.map(|_| true)
    }

    /// Applies the enablement to the capture track without renegotiating.
    pub async fn set_mic(&self, enabled: bool) -> Result<(), SessionError> {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        let active = inner.active.as_ref().ok_or(SessionError::NotConnected)?;
        active.session.enable_mic(enabled);
        inner.mic_enabled = enabled;
        Ok(())
    }

    /// Cancels the refresh timer and any in-flight connect, then closes the
    /// active session. Safe to call repeatedly.
    pub async fn close(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        shared.generation.fetch_add(1, Ordering::SeqCst);
        inner.cancel_refresh();
        inner.cancel_connect();
        inner.mic_enabled = false;

        match inner.active.take() {
            Some(active) => {
                shared.state.send_replace(SessionState::Closing);
                active.shutdown().await;
                shared.state.send_replace(SessionState::Closed);
                shared.hub.log("Session closed");
            }
            None => {
                shared.state.send_if_modified(|state| match state {
                    SessionState::Requesting | SessionState::Negotiating | SessionState::Failed => {
                        *state = SessionState::Idle;
                        true
                    }
                    _ => false,
                });
            }
        }
    }
}

impl Shared {
    async fn connect(
        self: &Arc<Self>,
        request: ConnectRequest,
        mic_enabled: bool,
        reason: ConnectReason,
    ) -> Result<Arc<RealtimeSession>, SessionError> {
        let (generation, cancel) = {
            let mut inner = self.inner.lock().await;
            if let ConnectReason::Refresh { generation } = reason
                && self.generation.load(Ordering::SeqCst) != generation
            {
                return Err(SessionError::Superseded);
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            inner.cancel_refresh();
            inner.cancel_connect();
            let cancel = CancellationToken::new();
            inner.connecting = Some(cancel.clone());
            inner.last_request = Some(request.clone());
            // Reports from the previous generation are filtered from here on,
            // so the controller publishes the teardown itself.
            if let Some(previous) = inner.active.take() {
                debug!(session_id = %previous.session.id(), "Closing previous session");
                self.state.send_replace(SessionState::Closing);
                previous.shutdown().await;
            }
            self.state.send_replace(SessionState::Requesting);
            (generation, cancel)
        };

        let session = match self
            .negotiator
            .negotiate(&request, &cancel, self.reporter(generation))
            .await
        {
            Ok(session) => Arc::new(session),
            Err(e) => return Err(self.connect_failed(generation, e).await),
        };

        let mut inner = self.inner.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            drop(inner);
            session.close().await;
            debug!(generation, "Discarding superseded session");
            return Err(SessionError::Superseded);
        }
        inner.connecting = None;

        if let Err(e) = session.send(self.session_update()).await {
            drop(inner);
            session.close().await;
            return Err(self.connect_failed(generation, e).await);
        }

        session.enable_mic(mic_enabled);
        inner.mic_enabled = mic_enabled;
        let pump = self.spawn_pump(Arc::clone(&session));
        inner.active = Some(Active {
            session: Arc::clone(&session),
            pump,
        });
        let delay = self.config.refresh_delay(session.credential_lifetime());
        inner.refresh = Some(self.schedule_refresh(generation, delay));
        drop(inner);

        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let verb = match reason {
            ConnectReason::User => "started",
            ConnectReason::Refresh { .. } => "refreshed",
        };
        info!(
            session_id = %session.id(),
            model = %session.model(),
            voice = %session.voice(),
            refresh_in_secs = delay.as_secs(),
            "Session {verb}"
        );
        self.hub.log(format!(
            "Session {verb} @ {stamp} model={} voice={}",
            session.model(),
            session.voice()
        ));
        Ok(session)
    }

    async fn connect_failed(&self, generation: u64, error: SessionError) -> SessionError {
        if error == SessionError::Superseded {
            debug!(generation, "Connect superseded");
            return error;
        }
        let mut inner = self.inner.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, error = %error, "Stale connect failed");
            return error;
        }
        inner.connecting = None;
        inner.mic_enabled = false;
        drop(inner);

        self.state.send_replace(SessionState::Idle);
        warn!(error = %error, "Connect failed");
        self.hub.log(format!("Connect error: {error}"));
        error
    }

    /// Forwards state changes only while `generation` is current.
    fn reporter(self: &Arc<Self>, generation: u64) -> StateReporter {
        let shared = Arc::downgrade(self);
        Arc::new(move |state| {
            if let Some(shared) = shared.upgrade()
                && shared.generation.load(Ordering::SeqCst) == generation
            {
                shared.state.send_replace(state);
            }
        })
    }

    fn session_update(&self) -> String {
        let tools: Vec<Value> = self
            .bridge
            .registry()
            .definitions()
            .map(ToolDefinition::to_session_tool)
            .collect();
        let tool_choice = if tools.is_empty() { "none" } else { "auto" };
        json!({
            "type": "session.update",
            "session": {
                "instructions": self.config.instructions,
                "tools": tools,
                "tool_choice": tool_choice,
            }
        })
        .to_string()
    }

    /// Reads the inbound stream in arrival order; tool calls run inline.
    fn spawn_pump(&self, session: Arc<RealtimeSession>) -> JoinHandle<()> {
        let inbound = session.peer().take_inbound();
        let bridge = self.bridge.clone();
        let mut channel = EventChannel::new(self.hub.clone());
        tokio::spawn(async move {
            let Some(mut inbound) = inbound else {
                warn!(session_id = %session.id(), "Inbound stream already taken");
                return;
            };
            while let Some(raw) = inbound.recv().await {
                let Ok(ChannelEvent::ToolCall(call)) = channel.ingest(&raw) else {
                    continue;
                };
                let outcome = bridge.dispatch(call).await;
                for message in outcome.reply_messages() {
                    if let Err(e) = session.send(message).await {
                        warn!(call_id = %outcome.call_id, error = %e, "Failed to return tool result");
                        break;
                    }
                }
            }
            debug!(session_id = %session.id(), "Inbound stream ended");
        })
    }

    fn schedule_refresh(self: &Arc<Self>, generation: u64, delay: Duration) -> RefreshTimer {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(shared) = shared.upgrade() {
                shared.refresh(generation).await;
            }
        });
        RefreshTimer { cancel, handle }
    }

    /// Reconnects with a fresh credential, keeping the microphone setting.
    fn refresh(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        async move {
            let (request, mic_enabled) = {
                let mut inner = self.inner.lock().await;
                if self.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                // This is the running timer; release the slot without aborting it.
                inner.refresh = None;
                match inner.last_request.clone() {
                    Some(request) => (request, inner.mic_enabled),
                    None => return,
                }
            };

            info!(mic_enabled, "Refreshing session credential before expiry");
            self.hub.log(format!(
                "Refreshing session before credential expiry (mic {})",
                if mic_enabled { "on" } else { "off" }
            ));
            // Failures are already logged and leave the controller Idle.
            let _ = self
                .connect(request, mic_enabled, ConnectReason::Refresh { generation })
                .await;
        }
        .boxed()
    }
}
