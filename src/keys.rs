//! RSA public-key reconstruction and the certificate cache.
//!
//! Offline verification needs the provider's signing key as a PEM. The
//! provider publishes it as JWK components (`n`, `e`); this module rebuilds
//! the PKCS#1 `RSAPublicKey` DER structure from those components and caches
//! the resulting PEM per `(public realm URL, kid)`.
//!
//! DER construction is a pure bytes-in/bytes-out function with no networking,
//! so it can be tested against `openssl`-generated fixtures directly.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use dashmap::DashMap;
use tracing::debug;

use crate::clients::ClientConfiguration;
use crate::provider::IdentityProviderClient;
use crate::{Error, Result};

/// Encode a DER length: one byte up to 127, otherwise `0x80 | n` followed by
/// `n` big-endian length bytes.
fn der_length(len: usize) -> Vec<u8> {
    if len <= 127 {
        return vec![len as u8];
    }

    let bytes = len.to_be_bytes();
    let significant: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    let mut out = Vec::with_capacity(1 + significant.len());
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(&significant);
    out
}

/// Encode an unsigned big-endian integer as a DER INTEGER. A set high bit in
/// the first byte gets a `0x00` prefix so the value is not read as negative.
fn der_integer(value: &[u8]) -> Vec<u8> {
    let needs_pad = value.first().is_some_and(|b| b & 0x80 != 0);
    let len = value.len() + usize::from(needs_pad);

    let mut out = vec![0x02];
    out.extend_from_slice(&der_length(len));
    if needs_pad {
        out.push(0x00);
    }
    out.extend_from_slice(value);
    out
}

/// Build a PKCS#1 `RSAPublicKey` PEM from raw modulus and exponent bytes:
/// `SEQUENCE { INTEGER n, INTEGER e }`, base64-wrapped at 64 columns.
#[must_use]
pub fn rsa_public_key_pem(modulus: &[u8], exponent: &[u8]) -> String {
    let mut body = der_integer(modulus);
    body.extend_from_slice(&der_integer(exponent));

    let mut der = vec![0x30];
    der.extend_from_slice(&der_length(body.len()));
    der.extend_from_slice(&body);

    let encoded = STANDARD.encode(&der);
    let mut pem = String::from("-----BEGIN RSA PUBLIC KEY-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END RSA PUBLIC KEY-----\n");
    pem
}

/// Build the PEM from base64url-encoded JWK `n`/`e` components.
pub fn rsa_pem_from_jwk(n: &str, e: &str) -> Result<String> {
    let modulus = URL_SAFE_NO_PAD
        .decode(n.trim_end_matches('='))
        .map_err(|_| Error::KeyFormat("modulus is not valid base64url".to_string()))?;
    let exponent = URL_SAFE_NO_PAD
        .decode(e.trim_end_matches('='))
        .map_err(|_| Error::KeyFormat("exponent is not valid base64url".to_string()))?;

    if modulus.is_empty() || exponent.is_empty() {
        return Err(Error::KeyFormat("empty modulus or exponent".to_string()));
    }

    Ok(rsa_public_key_pem(&modulus, &exponent))
}

/// Lazily populated cache of reconstructed signing keys.
///
/// Keyed by `(public realm URL, kid)`. Entries never expire; a provider key
/// rotation requires a gateway restart to pick up. Concurrent misses for the
/// same key recompute the same PEM, so insert order does not matter.
#[derive(Debug, Default)]
pub struct CertificateCache {
    inner: DashMap<(String, String), String>,
}

impl CertificateCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the PEM for `kid` issued by `client`'s realm, fetching and
    /// reconstructing it from the provider's key set on first use.
    ///
    /// # Errors
    ///
    /// Key-set fetch failures propagate; a key set without `kid`, or with an
    /// entry that is not an RS256 RSA key, is a key-format error.
    pub async fn get(
        &self,
        provider: &IdentityProviderClient,
        client: &ClientConfiguration,
        kid: &str,
    ) -> Result<String> {
        let cache_key = (client.realm_url.public.clone(), kid.to_string());
        if let Some(pem) = self.inner.get(&cache_key) {
            debug!(kid = %kid, "Certificate cache hit");
            return Ok(pem.clone());
        }

        debug!(kid = %kid, realm = %client.realm_url.public, "Certificate cache miss, fetching key set");
        let key_set = provider.fetch_key_set(client).await?;
        let key = key_set
            .keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or_else(|| Error::KeyFormat(format!("no key with kid \"{kid}\" in key set")))?;

        if key.kty != "RSA" || key.alg != "RS256" {
            return Err(Error::KeyFormat(format!(
                "key \"{kid}\" has unsupported kty/alg {}/{}",
                key.kty, key.alg
            )));
        }

        let pem = rsa_pem_from_jwk(&key.n, &key.e)?;
        self.inner.insert(cache_key, pem.clone());
        Ok(pem)
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the cache holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
