//! Client-side session layer for realtime voice conversations.
//!
//! A [`LifecycleController`] fetches an ephemeral credential from the broker,
//! negotiates a peer transport with the realtime service and keeps it alive,
//! while the [`EventChannel`] turns the inbound data channel into typed
//! [`ChannelEvent`]s and the [`ToolInvocationBridge`] answers tool calls.

pub mod credential;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod negotiator;
pub mod tools;

pub use credential::{ConnectRequest, Credential, CredentialProvider, HttpCredentialProvider};
pub use error::{SessionError, ToolError};
pub use events::{ChannelEvent, EventChannel, EventHub, Transcript, TranscriptSource};
pub use lifecycle::{LifecycleConfig, LifecycleController};
pub use negotiator::{
    AudioCapture, CaptureTrack, NegotiatorConfig, PeerConnection, PeerConnector, RealtimeSession,
    SessionNegotiator, SessionState,
};
pub use tools::{ToolDefinition, ToolInvocationBridge, ToolRegistry, default_registry};
