//! Wire calls against the OpenID-Connect identity provider.
//!
//! All provider traffic goes through one `reqwest` client with a bounded
//! timeout: authorization-URL construction, authorization-code exchange,
//! token refresh, logout/revocation, userinfo, and key-set fetch. Endpoints
//! follow the Keycloak realm layout (`/protocol/openid-connect/...`).
//!
//! Browser-facing URLs are built against a client's public realm URL;
//! server-to-server calls use the private realm URL.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::clients::{ClientConfiguration, ClientDirectory};
use crate::token::Token;
use crate::{Error, Result};

const AUTH_ENDPOINT: &str = "/protocol/openid-connect/auth";
const TOKEN_ENDPOINT: &str = "/protocol/openid-connect/token";
const USERINFO_ENDPOINT: &str = "/protocol/openid-connect/userinfo";
const LOGOUT_ENDPOINT: &str = "/protocol/openid-connect/logout";
const CERTS_ENDPOINT: &str = "/protocol/openid-connect/certs";

/// Scopes requested on every authorization redirect, before configured extras.
const BASE_SCOPES: [&str; 3] = ["openid", "email", "profile"];

/// Token endpoint response (authorization-code exchange and refresh grant).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// New access token (compact JWT).
    pub access_token: String,
    /// New refresh token (compact JWT).
    #[serde(default)]
    pub refresh_token: String,
    /// Access-token lifetime in seconds.
    #[serde(default)]
    pub expires_in: u64,
    /// Refresh-token lifetime in seconds.
    #[serde(default)]
    pub refresh_expires_in: u64,
}

/// Provider key set (JWKS).
#[derive(Debug, Clone, Deserialize)]
pub struct KeySet {
    /// Published signing keys.
    pub keys: Vec<KeySetEntry>,
}

/// One published signing key.
#[derive(Debug, Clone, Deserialize)]
pub struct KeySetEntry {
    /// Key id.
    #[serde(default)]
    pub kid: String,
    /// Key type (must be `RSA`).
    #[serde(default)]
    pub kty: String,
    /// Algorithm (must be `RS256`).
    #[serde(default)]
    pub alg: String,
    /// Modulus, base64url.
    #[serde(default)]
    pub n: String,
    /// Exponent, base64url.
    #[serde(default)]
    pub e: String,
}

/// Identity-provider client.
pub struct IdentityProviderClient {
    http: reqwest::Client,
    directory: Arc<ClientDirectory>,
    /// External base URL of this gateway, used to build `redirect_uri`s.
    public_url: String,
    callback_path: String,
    extra_scopes: Vec<String>,
}

impl IdentityProviderClient {
    /// Create a provider client with a bounded request timeout.
    pub fn new(
        directory: Arc<ClientDirectory>,
        public_url: String,
        callback_path: String,
        extra_scopes: Vec<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            directory,
            public_url: public_url.trim_end_matches('/').to_string(),
            callback_path,
            extra_scopes,
        })
    }

    /// The `redirect_uri` sent to the provider: the gateway's callback path
    /// carrying the original request path and the client's symbolic id.
    #[must_use]
    pub fn redirect_uri(&self, return_path: &str, sid: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("src", return_path)
            .append_pair("sid", sid)
            .finish();
        format!("{}{}?{query}", self.public_url, self.callback_path)
    }

    /// Build the interactive authorization URL for `client`, returning the
    /// browser to `return_path` after login.
    pub fn authorization_url(
        &self,
        client: &ClientConfiguration,
        return_path: &str,
    ) -> Result<String> {
        let mut url = Url::parse(&format!(
            "{}{AUTH_ENDPOINT}",
            client.realm_url.public.trim_end_matches('/')
        ))?;

        let scope = BASE_SCOPES
            .iter()
            .map(ToString::to_string)
            .chain(self.extra_scopes.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        url.query_pairs_mut()
            .append_pair("client_id", &client.client_id)
            .append_pair("redirect_uri", &self.redirect_uri(return_path, &client.sid))
            .append_pair("response_type", "code")
            .append_pair("scope", &scope);

        Ok(url.to_string())
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        client: &ClientConfiguration,
        code: &str,
        return_path: &str,
    ) -> Result<TokenResponse> {
        debug!(client = %client.sid, "Exchanging authorization code");
        let redirect_uri = self.redirect_uri(return_path, &client.sid);
        self.post_token(
            client,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &client.client_id),
                ("client_secret", &client.secret),
                ("redirect_uri", &redirect_uri),
            ],
        )
        .await
    }

    /// Refresh an access token. The issuing client is resolved from the
    /// refresh token's `azp` claim.
    pub async fn refresh(&self, refresh_token: &Token) -> Result<TokenResponse> {
        let client = self.directory.by_azp(&refresh_token.claims.azp)?;
        debug!(client = %client.sid, "Refreshing access token");
        self.post_token(
            client,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token.raw),
                ("client_id", &client.client_id),
                ("client_secret", &client.secret),
            ],
        )
        .await
    }

    /// Revoke a session at the provider. The client is resolved from the
    /// access token's `azp` claim.
    pub async fn logout(&self, access_token: &Token, refresh_token: &str) -> Result<()> {
        let client = self.directory.by_azp(&access_token.claims.azp)?;
        debug!(client = %client.sid, "Revoking session at provider");

        let response = self
            .http
            .post(format!(
                "{}{LOGOUT_ENDPOINT}",
                client.realm_url.private.trim_end_matches('/')
            ))
            .bearer_auth(&access_token.raw)
            .form(&[
                ("refresh_token", refresh_token),
                ("client_id", client.client_id.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            // Revocation failure is logged but does not block local logout;
            // cookies are cleared either way.
            warn!(status = %response.status(), "Provider logout returned non-success");
        }
        Ok(())
    }

    /// Check a bearer token against the provider's userinfo endpoint.
    ///
    /// Returns `false` on 401 (the token is simply not valid); any other
    /// non-2xx status propagates as a provider error.
    pub async fn check_userinfo(&self, client: &ClientConfiguration, bearer: &str) -> Result<bool> {
        let response = self
            .http
            .get(format!(
                "{}{USERINFO_ENDPOINT}",
                client.realm_url.private.trim_end_matches('/')
            ))
            .bearer_auth(bearer)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED => Ok(false),
            status => Err(Error::Provider {
                status,
                endpoint: USERINFO_ENDPOINT.to_string(),
            }),
        }
    }

    /// Fetch the provider's published key set for `client`'s realm.
    pub async fn fetch_key_set(&self, client: &ClientConfiguration) -> Result<KeySet> {
        debug!(client = %client.sid, "Fetching provider key set");
        let response = self
            .http
            .get(format!(
                "{}{CERTS_ENDPOINT}",
                client.realm_url.private.trim_end_matches('/')
            ))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Provider {
                status: response.status(),
                endpoint: CERTS_ENDPOINT.to_string(),
            });
        }

        Ok(response.json().await?)
    }

    async fn post_token(
        &self,
        client: &ClientConfiguration,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse> {
        let response = self
            .http
            .post(format!(
                "{}{TOKEN_ENDPOINT}",
                client.realm_url.private.trim_end_matches('/')
            ))
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Provider {
                status: response.status(),
                endpoint: TOKEN_ENDPOINT.to_string(),
            });
        }

        Ok(response.json().await?)
    }
}
