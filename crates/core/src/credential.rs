//! Ephemeral Credential Exchange
//!
//! The client never sees the long-lived service key. Instead it asks the
//! broker's `POST /session` endpoint for a short-lived secret that authorizes
//! exactly one transport negotiation.

use crate::error::SessionError;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Lifetime assumed for a credential when the broker does not report `expires_at`.
pub const DEFAULT_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(60);

/// What the caller asked for: where the broker lives and which model/voice to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub server_url: String,
    pub model: String,
    pub voice: String,
}

impl ConnectRequest {
    pub fn new(
        server_url: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            model: model.into(),
            voice: voice.into(),
        }
    }
}

/// A single-use ephemeral credential minted by the broker.
#[derive(Clone)]
pub struct Credential {
    secret: SecretString,
    pub model: String,
    pub voice: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        secret: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
        lifetime: Duration,
    ) -> Self {
        let issued_at = Utc::now();
        let lifetime = TimeDelta::from_std(lifetime).unwrap_or_else(|_| TimeDelta::days(365));
        Self {
            secret: SecretString::from(secret.into()),
            model: model.into(),
            voice: voice.into(),
            issued_at,
            expires_at: issued_at + lifetime,
        }
    }

    /// The bearer value used for the transport handshake.
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    /// How long the credential is valid for, measured from issuance.
    pub fn lifetime(&self) -> Duration {
        (self.expires_at - self.issued_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"[REDACTED]")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of ephemeral credentials.
///
/// The HTTP implementation talks to the broker; tests and embedders can supply
/// their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn request_credential(&self, request: &ConnectRequest)
    -> Result<Credential, SessionError>;
}

#[derive(Serialize)]
struct SessionRequestBody<'a> {
    model: &'a str,
    voice: &'a str,
}

#[derive(Deserialize)]
struct SessionResponseBody {
    client_secret: Option<String>,
    model: Option<String>,
    voice: Option<String>,
    expires_at: Option<i64>,
}

#[derive(Deserialize)]
struct BrokerErrorBody {
    error: String,
    details: Option<String>,
}

/// Calls the broker's `POST {server_url}/session` endpoint.
#[derive(Clone, Debug)]
pub struct HttpCredentialProvider {
    http: reqwest::Client,
    fallback_lifetime: Duration,
}

impl Default for HttpCredentialProvider {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl HttpCredentialProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            fallback_lifetime: DEFAULT_CREDENTIAL_LIFETIME,
        }
    }

    pub fn with_fallback_lifetime(mut self, lifetime: Duration) -> Self {
        self.fallback_lifetime = lifetime;
        self
    }

    fn lifetime_until(&self, expires_at: Option<i64>) -> Duration {
        expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(self.fallback_lifetime)
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn request_credential(
        &self,
        request: &ConnectRequest,
    ) -> Result<Credential, SessionError> {
        let url = format!("{}/session", request.server_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&SessionRequestBody {
                model: &request.model,
                voice: &request.voice,
            })
            .send()
            .await
            .map_err(|e| SessionError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SessionError::UpstreamUnavailable(e.to_string()))?;
        debug!(status = status.as_u16(), bytes = text.len(), "Broker responded");

        if !status.is_success() {
            return Err(map_broker_error(status.as_u16(), &text));
        }

        let body: SessionResponseBody = serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, "Broker returned an unparseable session body");
            SessionError::MissingClientSecret
        })?;
        let secret = body
            .client_secret
            .filter(|s| !s.is_empty())
            .ok_or(SessionError::MissingClientSecret)?;

        Ok(Credential::new(
            secret,
            body.model.unwrap_or_else(|| request.model.clone()),
            body.voice.unwrap_or_else(|| request.voice.clone()),
            self.lifetime_until(body.expires_at),
        ))
    }
}

/// Maps a broker error response onto the client error taxonomy.
fn map_broker_error(status: u16, text: &str) -> SessionError {
    let parsed = serde_json::from_str::<BrokerErrorBody>(text).ok();
    let code = parsed
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| text.chars().take(300).collect());
    let details = parsed.and_then(|b| b.details);

    match (status, code.as_str()) {
        (429, _) => SessionError::RateLimitExceeded,
        (_, "server_not_configured") => SessionError::Config(details.unwrap_or(code)),
        (_, "missing_client_secret") => SessionError::MissingClientSecret,
        (500..=599, _) => SessionError::UpstreamUnavailable(match details {
            Some(details) => format!("{code}: {details}"),
            None => code,
        }),
        _ => SessionError::CredentialRejected {
            status,
            code,
            details,
        },
    }
}

/// Exposes the secret for the `Authorization` header of the handshake.
pub(crate) fn bearer(credential: &Credential) -> String {
    format!("Bearer {}", credential.secret().expose_secret())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn requests_credential_and_echoes_model_and_voice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .and(body_json(json!({"model": "m1", "voice": "v1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "client_secret": "ek_test",
                "model": "m1",
                "voice": "v1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpCredentialProvider::default();
        let credential = provider
            .request_credential(&ConnectRequest::new(server.uri(), "m1", "v1"))
            .await
            .expect("credential should be issued");

        assert_eq!(credential.secret().expose_secret(), "ek_test");
        assert_eq!(credential.model, "m1");
        assert_eq!(credential.voice, "v1");
        assert_eq!(credential.lifetime(), DEFAULT_CREDENTIAL_LIFETIME);
    }

    #[tokio::test]
    async fn reported_expiry_drives_the_lifetime() {
        let server = MockServer::start().await;
        let expires_at = Utc::now().timestamp() + 600;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "client_secret": "ek_test",
                "model": "m1",
                "voice": "v1",
                "expires_at": expires_at
            })))
            .mount(&server)
            .await;

        let credential = HttpCredentialProvider::default()
            .request_credential(&ConnectRequest::new(server.uri(), "m1", "v1"))
            .await
            .unwrap();

        let lifetime = credential.lifetime().as_secs();
        assert!((595..=600).contains(&lifetime), "lifetime was {lifetime}");
    }

    #[tokio::test]
    async fn fallback_lifetime_applies_without_a_reported_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"client_secret": "ek_test"})))
            .mount(&server)
            .await;

        let credential = HttpCredentialProvider::new(reqwest::Client::new())
            .with_fallback_lifetime(Duration::from_secs(30))
            .request_credential(&ConnectRequest::new(server.uri(), "m1", "v1"))
            .await
            .unwrap();

        assert_eq!(credential.lifetime(), Duration::from_secs(30));
        assert_eq!(credential.model, "m1");
    }

    #[tokio::test]
    async fn rate_limited_broker_maps_to_rate_limit_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({"error": "rate_limit_exceeded"})),
            )
            .mount(&server)
            .await;

        let err = HttpCredentialProvider::default()
            .request_credential(&ConnectRequest::new(server.uri(), "m1", "v1"))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::RateLimitExceeded);
    }

    #[tokio::test]
    async fn failed_upstream_maps_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": "sessions_failed",
                "details": "upstream unreachable"
            })))
            .mount(&server)
            .await;

        let err = HttpCredentialProvider::default()
            .request_credential(&ConnectRequest::new(server.uri(), "m1", "v1"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::UpstreamUnavailable("sessions_failed: upstream unreachable".into())
        );
    }

    #[tokio::test]
    async fn missing_secret_is_a_stable_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"model": "m1"})))
            .mount(&server)
            .await;

        let err = HttpCredentialProvider::default()
            .request_credential(&ConnectRequest::new(server.uri(), "m1", "v1"))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::MissingClientSecret);
    }

    #[test]
    fn debug_output_redacts_the_secret() {
        let credential = Credential::new("ek_secret", "m", "v", Duration::from_secs(5));
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("ek_secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
