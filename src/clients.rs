//! Identity-provider client configurations and their directory.
//!
//! The gateway is multi-tenant: several provider clients (one per realm
//! application) can be configured, and resource policies pick one by symbolic
//! id. Tokens are mapped back to their issuing client via the `azp`
//! (authorized party) claim.

use serde::Deserialize;

use crate::{Error, Result};

/// Public/private base URLs of a provider realm.
///
/// The public URL is what browsers are redirected to; the private URL is used
/// for server-to-server calls (token exchange, userinfo, key-set fetch) and
/// may point inside the cluster network.
#[derive(Debug, Clone, Deserialize)]
pub struct RealmUrls {
    /// Browser-facing realm base URL.
    pub public: String,
    /// Server-to-server realm base URL.
    pub private: String,
}

/// A configured identity-provider client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfiguration {
    /// Symbolic id referenced by resource policies (`client_sid`).
    pub sid: String,
    /// OAuth2 client id registered with the provider.
    pub client_id: String,
    /// OAuth2 client secret.
    pub secret: String,
    /// Realm endpoint bases.
    pub realm_url: RealmUrls,
}

/// Immutable-after-load index of client configurations.
#[derive(Debug, Clone, Default)]
pub struct ClientDirectory {
    clients: Vec<ClientConfiguration>,
}

impl ClientDirectory {
    /// Build a directory from loaded configuration entries.
    #[must_use]
    pub fn new(clients: Vec<ClientConfiguration>) -> Self {
        Self { clients }
    }

    /// Look up a client by its symbolic id.
    pub fn by_sid(&self, sid: &str) -> Result<&ClientConfiguration> {
        self.clients
            .iter()
            .find(|c| c.sid == sid)
            .ok_or_else(|| Error::ClientResolution(format!("no client with sid \"{sid}\"")))
    }

    /// Look up the client a token was issued for, via its `azp` claim.
    pub fn by_azp(&self, azp: &str) -> Result<&ClientConfiguration> {
        self.clients
            .iter()
            .find(|c| c.client_id == azp)
            .ok_or_else(|| Error::ClientResolution(format!("no client with client_id \"{azp}\"")))
    }

    /// Whether any clients are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
