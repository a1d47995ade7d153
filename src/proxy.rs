//! Upstream request forwarding.
//!
//! Once the decision engine allows a request, it is replayed against the
//! configured upstream: same method and body, the (possibly rewritten) target
//! path with the original query string, and the original headers minus
//! hop-by-hop ones. The verified identity travels as `X-Auth-*` headers;
//! inbound `X-Auth-*` headers are always stripped so a client cannot forge
//! an identity the upstream trusts.
//!
//! The upstream response is streamed back without buffering.

use std::time::Duration;

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::Method;
use axum::response::Response;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::token::Token;
use crate::{Error, Result};

/// Verified compact access token, as received.
pub const HEADER_TOKEN: &str = "x-auth-token";
/// Comma-separated effective roles (realm roles plus `clientId:role` pairs).
pub const HEADER_ROLES: &str = "x-auth-roles";
/// `preferred_username` claim.
pub const HEADER_USERNAME: &str = "x-auth-username";
/// `email` claim.
pub const HEADER_EMAIL: &str = "x-auth-email";

/// Headers that describe the connection rather than the request and must not
/// be replayed upstream.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Identity headers for an authenticated request.
///
/// Empty roles and absent username/email claims produce no header at all, so
/// the upstream can distinguish "anonymous field" from "empty value".
pub(crate) fn identity_headers(token: &Token) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: &str| {
        match HeaderValue::from_str(value) {
            Ok(v) => {
                headers.insert(HeaderName::from_static(name), v);
            }
            Err(_) => warn!(header = name, "Claim value is not a valid header value, omitting"),
        }
    };

    put(HEADER_TOKEN, &token.raw);

    let roles = token.all_roles();
    if !roles.is_empty() {
        put(HEADER_ROLES, &roles.join(","));
    }
    if let Some(username) = token.claims.preferred_username.as_deref() {
        put(HEADER_USERNAME, username);
    }
    if let Some(email) = token.claims.email.as_deref() {
        put(HEADER_EMAIL, email);
    }

    headers
}

/// Copy request headers for upstream replay, dropping hop-by-hop headers,
/// `content-length` (recomputed for the new body), and any inbound `X-Auth-*`
/// header.
fn scrub_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut scrubbed = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name.as_str() == "content-length"
            || name.as_str().starts_with("x-auth-")
        {
            continue;
        }
        scrubbed.append(name.clone(), value.clone());
    }
    scrubbed
}

/// Forwards allowed requests to the single configured upstream.
pub struct UpstreamForwarder {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamForwarder {
    /// Create a forwarder for `base_url` with a bounded request timeout.
    ///
    /// Upstream redirects are passed through to the caller, never followed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Replay a request upstream and stream the response back.
    ///
    /// `path` is the decision's target path (after any `override` rewrite);
    /// `query` is the original query string; `identity` is the verified token
    /// for protected resources, `None` for public ones.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
        identity: Option<&Token>,
    ) -> Result<Response> {
        let mut url = format!("{}{path}", self.base_url);
        if let Some(query) = query {
            if !query.is_empty() {
                url.push('?');
                url.push_str(query);
            }
        }

        let mut outbound = scrub_request_headers(headers);
        if let Some(token) = identity {
            outbound.extend(identity_headers(token));
        }

        debug!(method = %method, url = %url, "Forwarding upstream");

        let upstream = self
            .http
            .request(method, &url)
            .headers(outbound)
            .body(body)
            .send()
            .await?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(response_headers) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name) {
                    response_headers.append(name.clone(), value.clone());
                }
            }
        }

        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| Error::Internal(format!("failed to assemble upstream response: {e}")))
    }
}
