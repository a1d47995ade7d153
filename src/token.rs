//! Compact JWT decoding and role semantics.
//!
//! Decoding is deliberately infallible: a bearer token that fails to parse is
//! represented as a token that is already expired (`exp = 0`), so every caller
//! treats malformed, truncated, and absent-claim tokens through the single
//! "expired/invalid" path instead of special-casing decode failures.
//!
//! No cryptographic checks happen here — signature verification lives in
//! [`crate::verify`].

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use tracing::debug;

/// JWT header fields the gateway cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenHeader {
    /// Key id used to select the verification key from the provider's key set.
    #[serde(default)]
    pub kid: String,
    /// Signing algorithm as declared by the issuer.
    #[serde(default)]
    pub alg: String,
}

/// A `roles` array nested under `realm_access` / `resource_access`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleSet {
    /// Role names.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Claims extracted from the token payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    /// Issuer realm URL.
    #[serde(default)]
    pub iss: String,
    /// Authorized party — the client id this token was issued for.
    #[serde(default)]
    pub azp: String,
    /// Expiry as seconds since the Unix epoch. `0` marks the sentinel token.
    #[serde(default)]
    pub exp: u64,
    /// Preferred username, when the `profile` scope was granted.
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Email address, when the `email` scope was granted.
    #[serde(default)]
    pub email: Option<String>,
    /// Realm-scoped roles.
    #[serde(default)]
    pub realm_access: RoleSet,
    /// Client-scoped roles, keyed by client id.
    #[serde(default)]
    pub resource_access: HashMap<String, RoleSet>,
}

/// Role requirement attached to a resource policy.
///
/// `all` is conjunctive and checked first; `any` is disjunctive and skipped
/// entirely when absent or empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleRequirement {
    /// Every listed role must be held.
    #[serde(default)]
    pub all: Option<Vec<String>>,
    /// At least one listed role must be held (if the list is non-empty).
    #[serde(default)]
    pub any: Option<Vec<String>>,
}

/// A decoded (not verified) compact JWT.
#[derive(Debug, Clone)]
pub struct Token {
    /// Original compact form, forwarded upstream in `X-Auth-Token`.
    pub raw: String,
    /// Decoded header.
    pub header: TokenHeader,
    /// Decoded claims.
    pub claims: Claims,
    /// `header.payload` — the input the signature covers.
    pub signed_input: String,
    /// Raw signature bytes.
    pub signature: Vec<u8>,
}

impl Token {
    /// Decode a compact JWT. Never fails: malformed input yields a sentinel
    /// token whose `exp` is `0`.
    #[must_use]
    pub fn decode(compact: &str) -> Self {
        match Self::try_decode(compact) {
            Some(token) => token,
            None => {
                debug!("Token failed to decode, treating as expired");
                Self {
                    raw: compact.to_string(),
                    header: TokenHeader::default(),
                    claims: Claims::default(),
                    signed_input: String::new(),
                    signature: Vec::new(),
                }
            }
        }
    }

    fn try_decode(compact: &str) -> Option<Self> {
        let parts: Vec<&str> = compact.split('.').collect();
        if parts.len() != 3 {
            return None;
        }

        let header_bytes = URL_SAFE_NO_PAD.decode(parts[0].trim_end_matches('=')).ok()?;
        let payload_bytes = URL_SAFE_NO_PAD.decode(parts[1].trim_end_matches('=')).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(parts[2].trim_end_matches('=')).ok()?;

        let header: TokenHeader = serde_json::from_slice(&header_bytes).ok()?;
        let claims: Claims = serde_json::from_slice(&payload_bytes).ok()?;

        Some(Self {
            raw: compact.to_string(),
            header,
            claims,
            signed_input: format!("{}.{}", parts[0], parts[1]),
            signature,
        })
    }

    /// Whether the token is expired right now.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Whether the token is expired at `now_ms` (milliseconds since epoch).
    #[must_use]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.claims.exp.saturating_mul(1000) < now_ms
    }

    /// Check a policy's role requirement against this token's claims.
    ///
    /// `all` roles are ANDed with short-circuit; a non-empty `any` list then
    /// requires at least one match. An absent or empty `any` passes.
    #[must_use]
    pub fn verify_roles(&self, required: &RoleRequirement) -> bool {
        if let Some(all) = &required.all {
            for role in all {
                if !self.has_role(role) {
                    debug!(role = %role, "Missing required role");
                    return false;
                }
            }
        }

        if let Some(any) = &required.any {
            if !any.is_empty() {
                return any.iter().any(|role| self.has_role(role));
            }
        }

        true
    }

    /// Check whether this token holds a role.
    ///
    /// A name containing `:` is split once into `clientId:roleName` and
    /// checked only against that client's roles from `resource_access`; a
    /// plain name is checked only against the realm roles. A client-qualified
    /// name never falls back to a realm role of the same spelling.
    #[must_use]
    pub fn has_role(&self, name: &str) -> bool {
        if let Some((client_id, role)) = name.split_once(':') {
            return self
                .claims
                .resource_access
                .get(client_id)
                .is_some_and(|set| set.roles.iter().any(|r| r == role));
        }

        self.claims.realm_access.roles.iter().any(|r| r == name)
    }

    /// All roles held by this token: `clientId:role` for every client role,
    /// plus bare realm roles.
    #[must_use]
    pub fn all_roles(&self) -> Vec<String> {
        let mut result = Vec::new();

        for (client_id, set) in &self.claims.resource_access {
            for role in &set.roles {
                result.push(format!("{client_id}:{role}"));
            }
        }

        result.extend(self.claims.realm_access.roles.iter().cloned());
        result
    }
}

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
