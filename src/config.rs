//! Configuration management
//!
//! Configuration is loaded once at startup from a YAML file merged with
//! `AUTHGATE_`-prefixed environment variables, validated, and then compiled
//! into the immutable registries the request path reads from. Nothing here is
//! mutated after load.

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::Deserialize;
use url::Url;

use crate::clients::ClientConfiguration;
use crate::policy::ResourceConfig;
use crate::verify::VerificationMode;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// External base URL of this gateway, used in `redirect_uri`s and for
    /// relative logout redirects.
    pub public_url: String,
    /// Upstream configuration
    pub upstream: UpstreamConfig,
    /// Token verification strategy
    pub verification: VerificationMode,
    /// Identity provider configuration
    pub provider: ProviderConfig,
    /// Reserved gateway route paths
    pub paths: PathsConfig,
    /// Session cookie configuration
    pub cookies: CookieConfig,
    /// Where logout sends the browser when the request has no `redirectTo`.
    /// A relative value is resolved against `public_url`.
    pub logout_redirect_url: String,
    /// Resource policies, in declaration order
    pub resources: Vec<ResourceConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Upstream service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the service allowed requests are forwarded to
    pub url: String,
    /// Per-request upstream timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Identity provider configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Scopes requested in addition to `openid email profile`
    pub scopes: Vec<String>,
    /// Per-request provider timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Configured provider clients, one per realm application
    pub clients: Vec<ClientConfiguration>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            scopes: Vec::new(),
            timeout: Duration::from_secs(10),
            clients: Vec::new(),
        }
    }
}

/// Reserved gateway route paths. Everything else is matched against the
/// resource policies.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Readiness endpoint
    pub health: String,
    /// Effective-roles endpoint
    pub roles: String,
    /// Access-probe endpoint
    pub access: String,
    /// OAuth2 authorization-code callback
    pub callback: String,
    /// Logout endpoint
    pub logout: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            health: "/health".to_string(),
            roles: "/roles".to_string(),
            access: "/access".to_string(),
            callback: "/oauth/callback".to_string(),
            logout: "/logout".to_string(),
        }
    }
}

/// Session cookie configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Access-token cookie name
    pub access_token: String,
    /// Refresh-token cookie name
    pub refresh_token: String,
    /// Mark cookies `Secure` (HTTPS-only). Disable only for local development.
    pub secure: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            access_token: "access_token".to_string(),
            refresh_token: "refresh_token".to_string(),
            secure: true,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTHGATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Everything that can be rejected before traffic arrives, is.
    fn validate(&self) -> Result<()> {
        if self.upstream.url.is_empty() {
            return Err(Error::Config("\"upstream.url\" is required".to_string()));
        }
        Url::parse(&self.upstream.url)
            .map_err(|e| Error::Config(format!("invalid \"upstream.url\": {e}")))?;

        if self.public_url.is_empty() {
            return Err(Error::Config("\"public_url\" is required".to_string()));
        }
        Url::parse(&self.public_url)
            .map_err(|e| Error::Config(format!("invalid \"public_url\": {e}")))?;

        for client in &self.provider.clients {
            for (name, value) in [
                ("realm_url.public", &client.realm_url.public),
                ("realm_url.private", &client.realm_url.private),
            ] {
                Url::parse(value).map_err(|e| {
                    Error::Config(format!(
                        "invalid \"{name}\" for client \"{}\": {e}",
                        client.sid
                    ))
                })?;
            }
        }

        let mut sids: Vec<&str> = self.provider.clients.iter().map(|c| c.sid.as_str()).collect();
        sids.sort_unstable();
        sids.dedup();
        if sids.len() != self.provider.clients.len() {
            return Err(Error::Config(
                "duplicate client \"sid\" in provider.clients".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
public_url: "https://gateway.example.com"
upstream:
  url: "http://backend.internal:3000"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config(MINIMAL);
        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.paths.callback, "/oauth/callback");
        assert_eq!(config.cookies.access_token, "access_token");
        assert!(config.cookies.secure);
        assert_eq!(config.verification, VerificationMode::Offline);
        assert_eq!(config.provider.timeout, Duration::from_secs(10));
        assert!(config.resources.is_empty());
    }

    #[test]
    fn full_config_parses_clients_and_resources() {
        let file = write_config(
            r#"
server:
  host: "127.0.0.1"
  port: 9000
public_url: "https://gateway.example.com"
upstream:
  url: "http://backend.internal:3000"
  timeout: 5s
verification: online
provider:
  scopes: ["offline_access"]
  timeout: 3s
  clients:
    - sid: main
      client_id: portal
      secret: s3cret
      realm_url:
        public: "https://idp.example.com/realms/main"
        private: "http://idp.internal/realms/main"
cookies:
  secure: false
resources:
  - match: "/api/.*"
    public: true
  - match: "/app/.*"
    sso_flow: true
    client_sid: main
    roles:
      any: ["user", "admin"]
"#,
        );
        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.verification, VerificationMode::Online);
        assert_eq!(config.upstream.timeout, Duration::from_secs(5));
        assert_eq!(config.provider.clients.len(), 1);
        assert_eq!(config.provider.clients[0].sid, "main");
        assert_eq!(config.resources.len(), 2);
        assert!(config.resources[0].public);
        assert!(config.resources[1].sso_flow);
        assert_eq!(
            config.resources[1].roles.as_ref().unwrap().any.as_deref(),
            Some(&["user".to_string(), "admin".to_string()][..])
        );
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = Config::load(Some(Path::new("/nonexistent/authgate.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_upstream_url_fails_validation() {
        let file = write_config("public_url: \"https://gateway.example.com\"\n");
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn invalid_realm_url_fails_validation() {
        let file = write_config(
            r#"
public_url: "https://gateway.example.com"
upstream:
  url: "http://backend.internal:3000"
provider:
  clients:
    - sid: main
      client_id: portal
      secret: s3cret
      realm_url:
        public: "not a url"
        private: "http://idp.internal/realms/main"
"#,
        );
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn duplicate_sids_fail_validation() {
        let file = write_config(
            r#"
public_url: "https://gateway.example.com"
upstream:
  url: "http://backend.internal:3000"
provider:
  clients:
    - sid: main
      client_id: portal
      secret: a
      realm_url: { public: "https://idp/realms/main", private: "http://idp/realms/main" }
    - sid: main
      client_id: other
      secret: b
      realm_url: { public: "https://idp/realms/main", private: "http://idp/realms/main" }
"#,
        );
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(Error::Config(_))
        ));
    }
}
