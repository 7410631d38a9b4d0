//! Client keys and the extractors that derive them from requests.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// Key used when a request carries nothing that identifies its client.
pub const FALLBACK_KEY: &str = "unknown";

/// Hex digits of the credential digest kept in a key (128 bits).
const CREDENTIAL_DIGEST_LEN: usize = 32;

/// Identity used for quota accounting.
///
/// Keys are namespaced by where they came from (`ip:`, `key:`), so an API
/// key can never collide with an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(String);

impl ClientKey {
    /// Wrap an already-formed key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for a client address.
    pub fn ip(addr: impl std::fmt::Display) -> Self {
        Self(format!("ip:{}", addr))
    }

    /// Key for an API credential.
    ///
    /// Only a truncated SHA-256 digest of the token is kept, so keys can be
    /// logged and used as store key names without leaking the credential.
    pub fn api_key(token: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(format!("key:{}", &digest[..CREDENTIAL_DIGEST_LEN]))
    }

    /// The shared bucket for unidentifiable clients.
    pub fn fallback() -> Self {
        Self(FALLBACK_KEY.to_string())
    }

    /// Whether this is the shared fallback bucket.
    pub fn is_fallback(&self) -> bool {
        self.0 == FALLBACK_KEY
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives a client identity from a request. Never fails.
pub trait KeyExtractor: Send + Sync {
    /// The key to account this request under.
    fn extract(&self, request: &Request) -> ClientKey;
}

impl<F> KeyExtractor for F
where
    F: Fn(&Request) -> Option<String> + Send + Sync,
{
    fn extract(&self, request: &Request) -> ClientKey {
        self(request)
            .filter(|key| !key.is_empty())
            .map(ClientKey::new)
            .unwrap_or_else(ClientKey::fallback)
    }
}

/// Identifies clients by address.
///
/// Trusted forwarding headers are consulted in order (for `X-Forwarded-For`
/// the leftmost entry is the client), then the connection's peer address.
#[derive(Debug, Clone)]
pub struct PeerIpExtractor {
    trusted_headers: Vec<String>,
}

impl PeerIpExtractor {
    /// Extractor trusting `X-Forwarded-For` then `X-Real-IP`.
    pub fn new() -> Self {
        Self::with_headers(["x-forwarded-for", "x-real-ip"])
    }

    /// Extractor trusting the given headers, in order. An empty list uses
    /// only the peer address.
    pub fn with_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trusted_headers: headers.into_iter().map(|h| h.into().to_ascii_lowercase()).collect(),
        }
    }

    /// Address named by the first trusted header that carries one.
    pub fn forwarded_ip(&self, headers: &HeaderMap) -> Option<String> {
        self.trusted_headers.iter().find_map(|name| {
            let value = headers.get(name.as_str())?.to_str().ok()?;
            let client = value.split(',').next()?.trim();
            (!client.is_empty()).then(|| client.to_string())
        })
    }
}

impl Default for PeerIpExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExtractor for PeerIpExtractor {
    fn extract(&self, request: &Request) -> ClientKey {
        if let Some(ip) = self.forwarded_ip(request.headers()) {
            return ClientKey::ip(ip);
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| ClientKey::ip(addr.ip()))
            .unwrap_or_else(ClientKey::fallback)
    }
}

/// Identifies clients by API credential, falling back to their address.
///
/// Reads `X-API-Key`, then an `Authorization: Bearer` token.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyExtractor {
    fallback: PeerIpExtractor,
}

impl ApiKeyExtractor {
    /// Use `fallback` for requests without a credential.
    pub fn new(fallback: PeerIpExtractor) -> Self {
        Self { fallback }
    }

    fn credential(headers: &HeaderMap) -> Option<&str> {
        if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            let key = key.trim();
            if !key.is_empty() {
                return Some(key);
            }
        }

        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

impl KeyExtractor for ApiKeyExtractor {
    fn extract(&self, request: &Request) -> ClientKey {
        match Self::credential(request.headers()) {
            Some(token) => ClientKey::api_key(token),
            None => self.fallback.extract(request),
        }
    }
}
