//! Error types for authgate

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

/// Result type alias for authgate
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
///
/// Taxonomy: configuration resolution failures and signature tampering are
/// internal errors (500); provider-side failures are upstream errors (500);
/// everything a well-behaved client can trigger maps to a 4xx.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (startup validation or per-request `$N` resolution)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No client configuration matches a symbolic id or `azp` claim
    #[error("Unable to resolve client configuration: {0}")]
    ClientResolution(String),

    /// Provider key-set entry missing or not an RS256 RSA key
    #[error("Missing or invalid key format: {0}")]
    KeyFormat(String),

    /// Token signature did not verify (possible tampering)
    #[error("Token verification failed: {0}")]
    Verification(#[from] jsonwebtoken::errors::Error),

    /// Malformed client request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Identity provider returned an unexpected status
    #[error("Identity provider error: HTTP {status} from {endpoint}")]
    Provider {
        /// Status returned by the provider
        status: StatusCode,
        /// Endpoint that failed
        endpoint: String,
    },

    /// Network failure talking to the identity provider or upstream
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL construction
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error surfaces as on the request path.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!(error = %self, status = %status, "Request failed");
        // Never leak internals to the client; the log line has the detail.
        let body = if status == StatusCode::BAD_REQUEST {
            self.to_string()
        } else {
            "Unexpected error".to_string()
        };
        (status, body).into_response()
    }
}
