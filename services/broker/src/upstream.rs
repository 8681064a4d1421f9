//! Upstream Session Minting
//!
//! Exchanges the broker's long-lived service key for a short-lived client
//! secret. The response body carries that secret, so only its status and
//! length are ever logged.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// Upstream error details are cut to this many characters before being
/// passed back to callers.
pub const MAX_DETAILS_CHARS: usize = 300;

/// A freshly minted ephemeral session.
#[derive(Debug, Clone)]
pub struct MintedSession {
    pub client_secret: SecretString,
    pub model: String,
    pub voice: String,
    /// Unix seconds, when upstream reports it.
    pub expires_at: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum MintError {
    #[error("upstream returned status {status}")]
    Status { status: u16, details: String },
    #[error("upstream unreachable: {0}")]
    Unavailable(String),
    #[error("upstream response did not include a client secret")]
    MissingClientSecret,
    #[error("upstream credential is not configured")]
    NotConfigured,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionMinter: Send + Sync {
    async fn mint(&self, model: &str, voice: &str) -> Result<MintedSession, MintError>;
}

#[derive(Serialize)]
struct MintRequest<'a> {
    model: &'a str,
    voice: &'a str,
    modalities: [&'a str; 2],
}

/// Mints sessions through `POST {base_url}/realtime/sessions`.
pub struct OpenAiSessionMinter {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl OpenAiSessionMinter {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl SessionMinter for OpenAiSessionMinter {
    async fn mint(&self, model: &str, voice: &str) -> Result<MintedSession, MintError> {
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(MintError::NotConfigured);
        }

        let url = format!("{}/realtime/sessions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .header("OpenAI-Beta", "realtime=v1")
            .json(&MintRequest {
                model,
                voice,
                modalities: ["text", "audio"],
            })
            .send()
            .await
            .map_err(|e| MintError::Unavailable(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MintError::Unavailable(e.to_string()))?;
        info!(status = status.as_u16(), bytes = text.len(), "Upstream session response");

        if !status.is_success() {
            return Err(MintError::Status {
                status: status.as_u16(),
                details: truncate(&text, MAX_DETAILS_CHARS),
            });
        }

        let data: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let (secret, expires_at) = extract_secret(&data).ok_or_else(|| {
            warn!("Upstream session response has no client secret");
            MintError::MissingClientSecret
        })?;

        Ok(MintedSession {
            client_secret: SecretString::from(secret),
            model: model.to_string(),
            voice: voice.to_string(),
            expires_at,
        })
    }
}

/// Accepts `client_secret: "..."`, `client_secret: {value, expires_at}` and a
/// top-level `value`.
fn extract_secret(data: &Value) -> Option<(String, Option<i64>)> {
    let nested = data.get("client_secret");
    let secret = match nested {
        Some(Value::String(value)) => Some(value.clone()),
        Some(object) => object.get("value").and_then(Value::as_str).map(str::to_string),
        None => None,
    }
    .or_else(|| data.get("value").and_then(Value::as_str).map(str::to_string))
    .filter(|secret| !secret.is_empty())?;

    let expires_at = nested
        .and_then(|object| object.get("expires_at"))
        .and_then(Value::as_i64)
        .or_else(|| data.get("expires_at").and_then(Value::as_i64));
    Some((secret, expires_at))
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
