//! authgate - OpenID-Connect authentication/authorization gateway
//!
//! Sits in front of an upstream HTTP service and enforces per-route
//! authentication and authorization against a Keycloak-style OpenID-Connect
//! identity provider.
//!
//! # Features
//!
//! - **Resource policies**: first-match regex routing with method filters,
//!   path rewriting, and per-route role requirements
//! - **Multi-tenant**: several provider clients, selected per route (including
//!   from path capture groups)
//! - **Online and offline verification**: userinfo round trip, or local RS256
//!   signature checks against keys reconstructed from the provider's JWKS
//! - **Session management**: cookie-based tokens, transparent refresh,
//!   interactive SSO login flow, logout with provider-side revocation
//! - **Identity forwarding**: `X-Auth-*` headers injected for the upstream

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clients;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod policy;
pub mod provider;
pub mod proxy;
pub mod server;
pub mod token;
pub mod verify;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
