//! Shared Application State
//!
//! Everything a handler needs, created once at startup.

use crate::{config::Config, rate_limit::RateLimiter, upstream::SessionMinter};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub minter: Arc<dyn SessionMinter>,
    pub rate_limiter: RateLimiter,
    pub default_model: String,
    pub default_voice: String,
}

impl AppState {
    pub fn new(config: &Config, minter: Arc<dyn SessionMinter>) -> Self {
        Self {
            minter,
            rate_limiter: RateLimiter::in_memory(config.rate_limit_max, config.rate_limit_window),
            default_model: config.default_model.clone(),
            default_voice: config.default_voice.clone(),
        }
    }
}
