//! Axum Router Configuration
//!
//! HTTP routing for the broker and the OpenAPI document describing it.

use crate::{
    handlers,
    models::{CreateSessionPayload, ErrorResponse, HealthResponse, SessionResponse},
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::create_session, handlers::health),
    components(
        schemas(CreateSessionPayload, SessionResponse, HealthResponse, ErrorResponse)
    ),
    tags(
        (name = "Voicelink Broker", description = "Ephemeral credentials for realtime voice sessions")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/session", post(handlers::create_session))
        .route("/health", get(handlers::health))
        .with_state(app_state)
}
