//! Voicelink Broker Library Crate
//!
//! The trusted backend that mints short-lived realtime credentials so the
//! long-lived service key never reaches the browser. The `broker` binary is
//! a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod rate_limit;
pub mod router;
pub mod state;
pub mod upstream;
