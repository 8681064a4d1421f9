//! Error taxonomy for the client-side session layer.

/// Errors surfaced by connect, refresh and mic operations.
///
/// Every variant is recoverable from the caller's point of view: the
/// controller logs one line, resets to `Idle` and leaves retrying to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("microphone access denied: {0}")]
    DeviceAccessDenied(String),
    #[error("rate limit exceeded, retry after the window resets")]
    RateLimitExceeded,
    #[error("credential service unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("credential service is not configured: {0}")]
    Config(String),
    #[error("credential request rejected ({status}): {code}")]
    CredentialRejected {
        status: u16,
        code: String,
        details: Option<String>,
    },
    #[error("credential response did not include a client secret")]
    MissingClientSecret,
    #[error("negotiation failed{}: {body}", status_suffix(.status))]
    NegotiationFailure { status: Option<u16>, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connect superseded by a newer request")]
    Superseded,
    #[error("no active session")]
    NotConnected,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl SessionError {
    /// Handshake timeout, reported as a negotiation failure without a status.
    pub(crate) fn handshake_timeout(after: std::time::Duration) -> Self {
        Self::NegotiationFailure {
            status: None,
            body: format!("handshake timed out after {}ms", after.as_millis()),
        }
    }
}

/// Errors raised by the tool registry and by tool handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("tool name must not be empty")]
    EmptyName,
    #[error("tool '{0}' is already registered")]
    Duplicate(String),
    #[error("tool '{name}' has an invalid parameter schema: {reason}")]
    InvalidSchema { name: String, reason: String },
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Handler(String),
}

impl ToolError {
    /// Stable machine-readable code sent back to the remote peer.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::EmptyName | ToolError::Duplicate(_) | ToolError::InvalidSchema { .. } => {
                "registration_error"
            }
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::Handler(_) => "handler_error",
        }
    }
}
