//! HTTP surface of the gateway.
//!
//! A handful of reserved paths (health, roles, access probe, OAuth callback,
//! logout) are handled by the gateway itself; every other request runs through
//! the decision engine and, if allowed, is forwarded upstream. The reserved
//! paths are configurable, so routing is one fallback handler dispatching on
//! the request path instead of a static route table.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde_json::json;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::clients::ClientDirectory;
use crate::config::{Config, CookieConfig, PathsConfig};
use crate::engine::{AccessDecisionEngine, Decision};
use crate::keys::CertificateCache;
use crate::policy::ResourceRegistry;
use crate::provider::{IdentityProviderClient, TokenResponse};
use crate::proxy::UpstreamForwarder;
use crate::token::{Token, now_millis};
use crate::verify::TokenVerifier;
use crate::{Error, Result};

/// Shared application state, immutable after startup (the certificate cache
/// is the only internally-mutating member).
pub struct AppState {
    /// Access-decision engine
    pub engine: AccessDecisionEngine,
    /// Identity-provider client
    pub provider: Arc<IdentityProviderClient>,
    /// Configured provider clients
    pub directory: Arc<ClientDirectory>,
    /// Upstream forwarder
    pub forwarder: UpstreamForwarder,
    /// Reserved route paths
    pub paths: PathsConfig,
    /// Session cookie settings
    pub cookies: CookieConfig,
    /// External base URL of the gateway
    pub public_url: String,
    /// Default logout redirect target
    pub logout_redirect_url: String,
}

impl AppState {
    /// Compile configuration into the runtime registries.
    ///
    /// # Errors
    ///
    /// Anything the load-time validation can catch: invalid resource
    /// patterns, `sso_flow` without a client, unknown literal `client_sid`s.
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let directory = Arc::new(ClientDirectory::new(config.provider.clients.clone()));
        let registry = Arc::new(ResourceRegistry::compile(&config.resources, &directory)?);
        let certificates = Arc::new(CertificateCache::new());

        let provider = Arc::new(IdentityProviderClient::new(
            Arc::clone(&directory),
            config.public_url.clone(),
            config.paths.callback.clone(),
            config.provider.scopes.clone(),
            config.provider.timeout,
        )?);

        let verifier = TokenVerifier::new(
            config.verification,
            Arc::clone(&directory),
            certificates,
        );

        let engine = AccessDecisionEngine::new(
            registry,
            Arc::clone(&directory),
            Arc::clone(&provider),
            verifier,
        );

        let forwarder = UpstreamForwarder::new(&config.upstream.url, config.upstream.timeout)?;

        if directory.is_empty() && config.resources.iter().any(|r| !r.public) {
            warn!("Protected resources configured but no provider clients; all protected requests will be denied");
        }

        Ok(Arc::new(Self {
            engine,
            provider,
            directory,
            forwarder,
            paths: config.paths.clone(),
            cookies: config.cookies.clone(),
            public_url: config.public_url.trim_end_matches('/').to_string(),
            logout_redirect_url: config.logout_redirect_url.clone(),
        }))
    }
}

/// The gateway server.
pub struct Gateway {
    config: Config,
}

impl Gateway {
    /// Create a gateway from loaded configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the gateway until shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = AppState::from_config(&self.config)?;
        let app = create_router(Arc::clone(&state));

        let listener = TcpListener::bind(addr).await?;

        info!("authgate v{}", env!("CARGO_PKG_VERSION"));
        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        info!(upstream = %self.config.upstream.url, "Forwarding to upstream");
        info!(
            clients = self.config.provider.clients.len(),
            resources = self.config.resources.len(),
            verification = ?self.config.verification,
            "Gateway ready"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutdown complete");
        Ok(())
    }
}

/// Create the router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Single entry point: reserved paths first, everything else through the
/// decision engine.
async fn dispatch(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();

    let result = if path == state.paths.health {
        Ok(health())
    } else if path == state.paths.roles {
        roles(&state, &headers, &jar)
    } else if path == state.paths.access {
        access_probe(&state, &uri, &headers, &jar)
    } else if path == state.paths.callback {
        callback(&state, &uri, jar).await
    } else if path == state.paths.logout {
        logout(&state, &uri, jar).await
    } else {
        gateway(&state, method, &uri, headers, jar, body).await
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

// ── Reserved routes ──────────────────────────────────────────────────────

/// Readiness endpoint.
fn health() -> Response {
    Json(json!({ "ready": true, "time": now_millis() })).into_response()
}

/// Effective roles of the presented token.
fn roles(state: &AppState, headers: &HeaderMap, jar: &CookieJar) -> Result<Response> {
    let Some(raw) = extract_raw_token(headers, jar, &state.cookies.access_token) else {
        return Ok((StatusCode::UNAUTHORIZED, "Unauthorized").into_response());
    };

    let token = Token::decode(&raw);
    Ok(Json(token.all_roles()).into_response())
}

/// Pure policy probe: `?resource=METHOD:PATH,METHOD:PATH,...` answered with a
/// map of each pair to whether it would currently be allowed.
fn access_probe(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    jar: &CookieJar,
) -> Result<Response> {
    let resource = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .find(|(key, _)| key == "resource")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| Error::BadRequest("missing \"resource\" query parameter".to_string()))?;

    let token = extract_raw_token(headers, jar, &state.cookies.access_token);

    let mut results = serde_json::Map::new();
    for entry in resource.split(',') {
        let Some((method, path)) = entry.split_once(':') else {
            return Err(Error::BadRequest(format!(
                "malformed resource entry \"{entry}\", expected METHOD:PATH"
            )));
        };
        if method.is_empty() || path.is_empty() {
            return Err(Error::BadRequest(format!(
                "malformed resource entry \"{entry}\", expected METHOD:PATH"
            )));
        }

        let allowed = state.engine.probe(path, method, token.as_deref())?;
        results.insert(entry.to_string(), serde_json::Value::Bool(allowed));
    }

    Ok(Json(serde_json::Value::Object(results)).into_response())
}

/// OAuth2 authorization-code callback: exchange the code, install the session
/// cookies, and send the browser back where it came from.
async fn callback(state: &AppState, uri: &Uri, jar: CookieJar) -> Result<Response> {
    let query: Vec<(String, String)> = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let param = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let code = param("code")
        .ok_or_else(|| Error::BadRequest("missing \"code\" query parameter".to_string()))?;
    let sid = param("sid")
        .ok_or_else(|| Error::BadRequest("missing \"sid\" query parameter".to_string()))?;
    let src = param("src").unwrap_or("/");

    let client = state
        .directory
        .by_sid(sid)
        .map_err(|_| Error::BadRequest(format!("unknown client \"{sid}\"")))?;

    let tokens = state.provider.exchange_code(client, code, src).await?;
    debug!(client = %sid, src = %src, "Authorization code exchanged, installing session");

    let target = callback_target(src, &state.public_url);
    let jar = install_session(jar, &tokens, &state.cookies);
    Ok((jar, Redirect::temporary(&target)).into_response())
}

/// Logout: revoke the provider session when possible, clear the cookies
/// either way, and redirect.
async fn logout(state: &AppState, uri: &Uri, jar: CookieJar) -> Result<Response> {
    let access = jar
        .get(&state.cookies.access_token)
        .map(|c| c.value().to_string());
    let refresh = jar
        .get(&state.cookies.refresh_token)
        .map(|c| c.value().to_string());

    if let (Some(access), Some(refresh)) = (&access, &refresh) {
        let token = Token::decode(access);
        if let Err(e) = state.provider.logout(&token, refresh).await {
            // Local logout proceeds regardless; the session cookies die here.
            warn!(error = %e, "Provider session revocation failed");
        }
    }

    let redirect_to = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .find(|(key, _)| key == "redirectTo")
        .map(|(_, value)| value.into_owned());
    let target = logout_target(
        redirect_to.as_deref(),
        &state.logout_redirect_url,
        &state.public_url,
    );

    let jar = jar
        .add(expired_cookie(&state.cookies.access_token, state.cookies.secure))
        .add(expired_cookie(&state.cookies.refresh_token, state.cookies.secure));
    Ok((jar, Redirect::temporary(&target)).into_response())
}

/// Everything else: decide, then forward or reject.
async fn gateway(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    jar: CookieJar,
    body: Bytes,
) -> Result<Response> {
    let access = extract_raw_token(&headers, &jar, &state.cookies.access_token);
    let refresh = jar
        .get(&state.cookies.refresh_token)
        .map(|c| c.value().to_string());

    let decision = state
        .engine
        .decide(uri.path(), method.as_str(), access.as_deref(), refresh.as_deref())
        .await?;

    match decision {
        Decision::NotFound => Ok((StatusCode::NOT_FOUND, "Not found").into_response()),
        Decision::Redirect { location } => Ok(Redirect::temporary(&location).into_response()),
        Decision::Denied { status, issued } => {
            let body = status.canonical_reason().unwrap_or("Denied").to_string();
            match issued {
                Some(tokens) => {
                    let jar = install_session(jar, &tokens, &state.cookies);
                    Ok((jar, (status, body)).into_response())
                }
                None => Ok((status, body).into_response()),
            }
        }
        Decision::Allow(allowance) => {
            let response = state
                .forwarder
                .forward(
                    method,
                    &allowance.path,
                    uri.query(),
                    &headers,
                    body,
                    allowance.token.as_ref(),
                )
                .await?;

            match allowance.issued {
                Some(tokens) => {
                    let jar = install_session(jar, &tokens, &state.cookies);
                    Ok((jar, response).into_response())
                }
                None => Ok(response),
            }
        }
    }
}

// ── Token and cookie plumbing ────────────────────────────────────────────

/// Raw access token from the `Authorization: Bearer` header, falling back to
/// the access cookie.
fn extract_raw_token(headers: &HeaderMap, jar: &CookieJar, cookie_name: &str) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(bearer) = value.strip_prefix("Bearer ") {
            return Some(bearer.to_string());
        }
    }
    jar.get(cookie_name).map(|c| c.value().to_string())
}

/// A session cookie expiring one second before the token it carries, so the
/// browser never presents a token the gateway would have to reject.
fn session_cookie(
    name: &str,
    value: String,
    lifetime_secs: u64,
    secure: bool,
) -> Cookie<'static> {
    let lifetime = i64::try_from(lifetime_secs).unwrap_or(i64::MAX);
    let expires = OffsetDateTime::now_utc() + time::Duration::seconds(lifetime.saturating_sub(1));

    let mut cookie = Cookie::new(name.to_owned(), value);
    cookie.set_path("/");
    cookie.set_same_site(SameSite::Lax);
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_expires(expires);
    cookie
}

/// A cookie that clears its namesake: empty value, expired at the epoch.
fn expired_cookie(name: &str, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(name.to_owned(), String::new());
    cookie.set_path("/");
    cookie.set_same_site(SameSite::Lax);
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_expires(OffsetDateTime::UNIX_EPOCH);
    cookie
}

/// Install access and refresh cookies from a token-endpoint response.
fn install_session(jar: CookieJar, tokens: &TokenResponse, config: &CookieConfig) -> CookieJar {
    let jar = jar.add(session_cookie(
        &config.access_token,
        tokens.access_token.clone(),
        tokens.expires_in,
        config.secure,
    ));
    if tokens.refresh_token.is_empty() {
        jar
    } else {
        jar.add(session_cookie(
            &config.refresh_token,
            tokens.refresh_token.clone(),
            tokens.refresh_expires_in,
            config.secure,
        ))
    }
}

/// Post-login redirect target: `src` anchored to the gateway's own public
/// URL, so a tampered `src` can never send the browser off-site. Anything
/// that is not a path collapses to the site root.
fn callback_target(src: &str, public_url: &str) -> String {
    if src.starts_with('/') {
        format!("{public_url}{src}")
    } else {
        format!("{public_url}/")
    }
}

/// Resolve the logout redirect target: explicit `redirectTo` first, then the
/// configured default, with relative targets anchored at the public URL.
fn logout_target(redirect_to: Option<&str>, configured: &str, public_url: &str) -> String {
    let target = redirect_to.unwrap_or(if configured.is_empty() { "/" } else { configured });
    if target.starts_with('/') {
        format!("{public_url}{target}")
    } else {
        target.to_string()
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
