//! API Models
//!
//! Request and response bodies of the broker's HTTP surface, annotated with
//! `utoipa` for the OpenAPI document.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Body of `POST /session`. Both fields fall back to the configured defaults.
#[derive(Deserialize, ToSchema, Debug, Default, Clone, PartialEq, Eq)]
pub struct CreateSessionPayload {
    #[schema(example = "gpt-4o-realtime-preview")]
    pub model: Option<String>,
    #[schema(example = "marin")]
    pub voice: Option<String>,
}

/// A minted ephemeral session, returned to the browser client.
#[derive(Serialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct SessionResponse {
    /// Single-use secret authorizing one transport negotiation.
    pub client_secret: String,
    pub model: String,
    pub voice: String,
    /// Unix seconds, when upstream reports an expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct HealthResponse {
    pub ok: bool,
}

/// Stable error body. `error` is a machine-readable code.
#[derive(Serialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    #[schema(example = "rate_limit_exceeded")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
