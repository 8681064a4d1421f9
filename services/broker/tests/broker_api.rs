//! End-to-end tests: a real broker on a local port, a mocked upstream, and
//! the client-side credential provider talking to it.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use voicelink_broker::{
    rate_limit::RateLimiter, router::create_router, state::AppState,
    upstream::OpenAiSessionMinter,
};
use voicelink_core::{ConnectRequest, CredentialProvider, HttpCredentialProvider, SessionError};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
};

/// Serves the broker on an ephemeral port and returns its base URL.
async fn spawn_broker(upstream_base_url: String) -> String {
    let minter = Arc::new(OpenAiSessionMinter::new(
        reqwest::Client::new(),
        upstream_base_url,
        SecretString::from("sk-server-only"),
    ));
    let state = Arc::new(AppState {
        minter,
        rate_limiter: RateLimiter::in_memory(10, Duration::from_secs(60)),
        default_model: "gpt-4o-realtime-preview".to_string(),
        default_voice: "marin".to_string(),
    });
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn client_receives_an_ephemeral_secret_but_never_the_server_key() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/realtime/sessions"))
        .and(header("authorization", "Bearer sk-server-only"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sess_1",
            "client_secret": {"value": "ek_ephemeral", "expires_at": 4_102_444_800i64}
        })))
        .expect(1)
        .mount(&upstream)
        .await;
    let broker = spawn_broker(format!("{}/v1", upstream.uri())).await;

    let raw: Value = reqwest::Client::new()
        .post(format!("{broker}/session"))
        .json(&json!({"model": "m1", "voice": "v1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(raw["client_secret"], "ek_ephemeral");
    assert_eq!(raw["model"], "m1");
    assert_eq!(raw["voice"], "v1");
    assert!(!raw.to_string().contains("sk-server-only"));

    upstream.reset().await;
    Mock::given(method("POST"))
        .and(path("/v1/realtime/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "client_secret": "ek_second"
        })))
        .mount(&upstream)
        .await;

    let credential = HttpCredentialProvider::default()
        .request_credential(&ConnectRequest::new(broker.clone(), "m2", "v2"))
        .await
        .unwrap();
    assert_eq!(credential.secret().expose_secret(), "ek_second");
    assert_eq!(credential.model, "m2");
    assert_eq!(credential.voice, "v2");
}

#[tokio::test]
async fn unreachable_upstream_returns_sessions_failed() {
    // Nothing listens on port 1.
    let broker = spawn_broker("http://127.0.0.1:1/v1".to_string()).await;

    let response = reqwest::Client::new()
        .post(format!("{broker}/session"))
        .json(&json!({"model": "m1", "voice": "v1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "sessions_failed");
    assert!(body["details"].is_string());

    let err = HttpCredentialProvider::default()
        .request_credential(&ConnectRequest::new(broker, "m1", "v1"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UpstreamUnavailable(ref d) if d.starts_with("sessions_failed")));
}

#[tokio::test]
async fn upstream_rejection_passes_status_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/realtime/sessions"))
        .respond_with(ResponseTemplate::new(403).set_body_string("model not available"))
        .mount(&upstream)
        .await;
    let broker = spawn_broker(format!("{}/v1", upstream.uri())).await;

    let err = HttpCredentialProvider::default()
        .request_credential(&ConnectRequest::new(broker, "m1", "v1"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SessionError::CredentialRejected {
            status: 403,
            code: "sessions_failed".into(),
            details: Some("model not available".into()),
        }
    );
}

#[tokio::test]
async fn eleventh_request_is_rate_limited_end_to_end() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/realtime/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"client_secret": "ek"})))
        .expect(10)
        .mount(&upstream)
        .await;
    let broker = spawn_broker(format!("{}/v1", upstream.uri())).await;
    let provider = HttpCredentialProvider::default();
    let request = ConnectRequest::new(broker, "m1", "v1");

    for n in 1..=10 {
        assert!(provider.request_credential(&request).await.is_ok(), "request {n}");
    }
    assert_eq!(
        provider.request_credential(&request).await.unwrap_err(),
        SessionError::RateLimitExceeded
    );
}
