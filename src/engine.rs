//! The access-decision engine.
//!
//! One decision per request, computed strictly before any forwarding:
//!
//! ```text
//! match resource ── none ──────────────▶ NotFound (404)
//!      │ public ────────────────────────▶ Allow
//!      ▼
//! extract token ── absent ─────────────▶ unauthorized flow
//!      ▼
//! verify ── invalid/expired ───────────▶ unauthorized flow
//!      │ valid, roles fail ─────────────▶ Denied (403)
//!      │ valid, roles ok ───────────────▶ Allow
//!
//! unauthorized flow:
//!   unexpired refresh cookie ──▶ refresh, install cookies, re-check roles
//!   sso_flow ──────────────────▶ Redirect (307) to the provider login
//!   otherwise ─────────────────▶ Denied (401)
//! ```
//!
//! Tokens returned by a refresh were just issued by the provider, so they are
//! trusted locally without another signature/userinfo round trip.

use std::sync::Arc;

use axum::http::StatusCode;
use tracing::{debug, warn};

use crate::clients::ClientDirectory;
use crate::policy::{ResolvedResource, ResourceRegistry};
use crate::provider::{IdentityProviderClient, TokenResponse};
use crate::token::Token;
use crate::verify::TokenVerifier;
use crate::{Error, Result};

/// The outcome of the decision state machine for one request.
#[derive(Debug)]
pub enum Decision {
    /// No resource policy matched the request (404).
    NotFound,
    /// The request may be forwarded upstream.
    Allow(Allowance),
    /// Send the browser into the interactive login flow (307).
    Redirect {
        /// Provider authorization URL.
        location: String,
    },
    /// The request is denied with `status` (401 or 403).
    Denied {
        /// Response status.
        status: StatusCode,
        /// Fresh tokens to install as cookies even though the request was
        /// denied (a refresh succeeded but the role check then failed).
        issued: Option<TokenResponse>,
    },
}

/// An allowed request: where to forward it and under which identity.
#[derive(Debug)]
pub struct Allowance {
    /// Upstream path (after any `override` rewrite).
    pub path: String,
    /// Verified identity, absent for public resources.
    pub token: Option<Token>,
    /// Fresh tokens to install as cookies (set when a refresh happened).
    pub issued: Option<TokenResponse>,
}

/// Orchestrates registry, directory, verifier, and provider into one
/// decision per request.
pub struct AccessDecisionEngine {
    registry: Arc<ResourceRegistry>,
    directory: Arc<ClientDirectory>,
    provider: Arc<IdentityProviderClient>,
    verifier: TokenVerifier,
}

impl AccessDecisionEngine {
    /// Wire up the engine from its immutable-after-load collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ResourceRegistry>,
        directory: Arc<ClientDirectory>,
        provider: Arc<IdentityProviderClient>,
        verifier: TokenVerifier,
    ) -> Self {
        Self {
            registry,
            directory,
            provider,
            verifier,
        }
    }

    /// Decide what to do with a request.
    ///
    /// `access_token` and `refresh_token` are the raw compact tokens as
    /// extracted from the `Authorization` header / cookies by the caller.
    pub async fn decide(
        &self,
        path: &str,
        method: &str,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<Decision> {
        let Some(resource) = self.registry.resolve(path, method, &self.directory)? else {
            return Ok(Decision::NotFound);
        };

        if resource.public {
            debug!(path = %path, "Public resource, forwarding without identity");
            return Ok(Decision::Allow(Allowance {
                path: resource.path,
                token: None,
                issued: None,
            }));
        }

        let Some(raw) = access_token else {
            debug!(path = %path, "No access token present");
            return self.unauthorized(&resource, path, refresh_token).await;
        };

        let token = Token::decode(raw);
        let valid = !token.is_expired()
            && self
                .verifier
                .verify(&self.provider, &token, resource.client.as_ref())
                .await?;

        if !valid {
            debug!(path = %path, "Access token invalid or expired");
            return self.unauthorized(&resource, path, refresh_token).await;
        }

        Ok(Self::authorize(&resource, token, None))
    }

    /// Pure policy probe: would `method path` be allowed for this token?
    ///
    /// Same matching, expiry, and role logic as [`Self::decide`], but never
    /// redirects, refreshes, or performs verification network calls.
    pub fn probe(&self, path: &str, method: &str, access_token: Option<&str>) -> Result<bool> {
        let Some(resource) = self.registry.resolve(path, method, &self.directory)? else {
            return Ok(false);
        };

        if resource.public {
            return Ok(true);
        }

        let Some(raw) = access_token else {
            return Ok(false);
        };

        let token = Token::decode(raw);
        if token.is_expired() {
            return Ok(false);
        }

        match &resource.roles {
            Some(required) => Ok(token.verify_roles(required)),
            None => Ok(true),
        }
    }

    /// Role check and terminal state for a token accepted as valid.
    fn authorize(
        resource: &ResolvedResource,
        token: Token,
        issued: Option<TokenResponse>,
    ) -> Decision {
        if let Some(required) = &resource.roles {
            if !token.verify_roles(required) {
                debug!("Role requirement not met");
                return Decision::Denied {
                    status: StatusCode::FORBIDDEN,
                    issued,
                };
            }
        }

        Decision::Allow(Allowance {
            path: resource.path.clone(),
            token: Some(token),
            issued,
        })
    }

    /// The unauthorized flow: try the refresh-token cookie, then fall back to
    /// an SSO redirect or a plain 401.
    async fn unauthorized(
        &self,
        resource: &ResolvedResource,
        original_path: &str,
        refresh_token: Option<&str>,
    ) -> Result<Decision> {
        if let Some(raw) = refresh_token {
            let refresh = Token::decode(raw);
            if !refresh.is_expired() {
                match self.provider.refresh(&refresh).await {
                    Ok(response) => {
                        debug!("Access token refreshed");
                        let token = Token::decode(&response.access_token);
                        return Ok(Self::authorize(resource, token, Some(response)));
                    }
                    // A rejected refresh (revoked session, stale token) is not
                    // fatal; the user just logs in again.
                    Err(Error::Provider { status, endpoint }) => {
                        warn!(status = %status, endpoint = %endpoint, "Refresh rejected by provider");
                    }
                    Err(other) => return Err(other),
                }
            }
        }

        if resource.sso_flow {
            let client = resource.client.as_ref().ok_or_else(|| {
                // compile() guarantees sso_flow resources carry a client
                Error::Internal("sso_flow resource without resolved client".to_string())
            })?;
            let location = self.provider.authorization_url(client, original_path)?;
            return Ok(Decision::Redirect { location });
        }

        Ok(Decision::Denied {
            status: StatusCode::UNAUTHORIZED,
            issued: None,
        })
    }
}
