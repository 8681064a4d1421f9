//! Main Entrypoint for the Voicelink Broker
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the upstream session minter and the rate limiter.
//! 3. Constructing the Axum router and applying the CORS allowlist.
//! 4. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use axum::http::{HeaderValue, Method, header};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info};
use voicelink_broker::{
    config::Config, router::create_router, state::AppState, upstream::OpenAiSessionMinter,
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {e}");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("Invalid CORS origin '{origin}'"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let minter = Arc::new(OpenAiSessionMinter::new(
        http,
        config.upstream_base_url.clone(),
        config.openai_api_key.clone(),
    ));
    let app_state = Arc::new(AppState::new(&config, minter));

    let limiter = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(limiter.window());
        loop {
            sweep.tick().await;
            limiter.sweep().await;
        }
    });

    // --- 4. Create Router and Apply Middleware ---
    let app = create_router(app_state).layer(cors_layer(&config.cors_origins)?);

    // --- 5. Start Server ---
    info!(
        bind_address = %config.bind_address,
        upstream = %config.upstream_base_url,
        cors_origins = ?config.cors_origins,
        rate_limit_max = config.rate_limit_max,
        rate_limit_window_secs = config.rate_limit_window.as_secs(),
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
