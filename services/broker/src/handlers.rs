//! Axum Handlers for the Broker API
//!
//! `POST /session` mints an ephemeral realtime credential for the caller;
//! `GET /health` is a liveness check. Every failure maps to a stable JSON
//! error code.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Json, Response},
};
use secrecy::ExposeSecret;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tracing::{error, info, instrument, warn};

use crate::{
    models::{CreateSessionPayload, ErrorResponse, HealthResponse, SessionResponse},
    rate_limit::Decision,
    state::AppState,
    upstream::MintError,
};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },
    #[error("upstream session request failed with status {status}")]
    Upstream { status: StatusCode, details: String },
    #[error("upstream unreachable: {0}")]
    Unavailable(String),
    #[error("upstream response did not include a client secret")]
    MissingClientSecret,
    #[error("server not configured: missing OPENAI_API_KEY")]
    NotConfigured,
}

impl BrokerError {
    /// Stable machine-readable code for the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::RateLimited { .. } => "rate_limit_exceeded",
            BrokerError::Upstream { .. } | BrokerError::Unavailable(_) => "sessions_failed",
            BrokerError::MissingClientSecret => "missing_client_secret",
            BrokerError::NotConfigured => "server_not_configured",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            BrokerError::Upstream { status, .. } => *status,
            BrokerError::Unavailable(_)
            | BrokerError::MissingClientSecret
            | BrokerError::NotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MintError> for BrokerError {
    fn from(err: MintError) -> Self {
        match err {
            MintError::Status { status, details } => BrokerError::Upstream {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                details,
            },
            MintError::Unavailable(details) => BrokerError::Unavailable(details),
            MintError::MissingClientSecret => BrokerError::MissingClientSecret,
            MintError::NotConfigured => BrokerError::NotConfigured,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let details = match &self {
            BrokerError::Upstream { details, .. } | BrokerError::Unavailable(details) => {
                Some(details.clone())
            }
            BrokerError::NotConfigured => Some(self.to_string()),
            BrokerError::RateLimited { .. } | BrokerError::MissingClientSecret => None,
        };
        if status.is_server_error() {
            error!(code = self.code(), "Session request failed: {}", self);
        } else {
            warn!(code = self.code(), "Session request rejected: {}", self);
        }

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            details,
        });
        match self {
            BrokerError::RateLimited { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                let mut response = (status, body).into_response();
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            _ => (status, body).into_response(),
        }
    }
}

/// Who is asking: the peer address, else the first `x-forwarded-for` hop,
/// else `"unknown"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(Self(addr.ip().to_string()));
        }
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        Ok(Self(forwarded.unwrap_or("unknown").to_string()))
    }
}

/// Mint an ephemeral realtime session credential.
#[utoipa::path(
    post,
    path = "/session",
    request_body = CreateSessionPayload,
    responses(
        (status = 200, description = "Ephemeral credential minted", body = SessionResponse),
        (status = 429, description = "Caller exceeded the request quota", body = ErrorResponse),
        (status = 500, description = "Upstream unreachable, missing secret or server not configured", body = ErrorResponse)
    ),
    tag = "Voicelink Broker"
)]
#[instrument(name = "session_request", skip_all, fields(caller = %identity.0))]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    identity: CallerIdentity,
    body: Bytes,
) -> Result<Json<SessionResponse>, BrokerError> {
    if let Decision::Limited { retry_after } = state.rate_limiter.check(&identity.0).await {
        return Err(BrokerError::RateLimited { retry_after });
    }

    // A missing or non-JSON body falls back to the defaults.
    let payload: CreateSessionPayload = serde_json::from_slice(&body).unwrap_or_default();
    let model = payload.model.unwrap_or_else(|| state.default_model.clone());
    let voice = payload.voice.unwrap_or_else(|| state.default_voice.clone());

    let minted = state.minter.mint(&model, &voice).await?;
    info!(model = %minted.model, voice = %minted.voice, expires_at = ?minted.expires_at, "Session minted");

    Ok(Json(SessionResponse {
        client_secret: minted.client_secret.expose_secret().to_string(),
        model: minted.model,
        voice: minted.voice,
        expires_at: minted.expires_at,
    }))
}

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    ),
    tag = "Voicelink Broker"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}
