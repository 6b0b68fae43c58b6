//! Rate limit key generation and request context.

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Header carrying the forwarded-address chain set by proxies.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Address used when neither a forwarded chain nor a peer address is known.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Separator between the parts of a [`RateLimitKey`].
pub const KEY_SEPARATOR: char = ':';

/// A key that uniquely identifies a counter bucket.
///
/// Composed as `prefix:kind:value`, e.g. `login:user:42` or
/// `login:ip:10.0.0.7`. Opaque to everything except the store.
///
/// Policy prefixes never contain the separator, so the first `:` always ends
/// the prefix and values (IPv6 addresses, user ids) may contain it freely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Build a key from its three parts.
    pub fn new(prefix: &str, kind: &str, value: &str) -> Self {
        Self(format!("{prefix}{KEY_SEPARATOR}{kind}{KEY_SEPARATOR}{value}"))
    }

    /// Key for an authenticated caller.
    pub fn user(prefix: &str, id: &str) -> Self {
        Self::new(prefix, "user", id)
    }

    /// Key for an anonymous caller, by client address.
    pub fn ip(prefix: &str, address: &str) -> Self {
        Self::new(prefix, "ip", address)
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RateLimitKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Caller identity attached by the authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user identifier
    #[serde(default)]
    pub id: Option<String>,
    /// Role used for bypass checks
    #[serde(default)]
    pub role: Option<String>,
}

impl Identity {
    /// An identity with an id and no role.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            role: None,
        }
    }

    /// Attach a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Everything the limiter needs to know about one request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Identity resolved upstream, if any
    pub identity: Option<Identity>,
    /// Request headers (forwarded chain, fingerprints)
    pub headers: HeaderMap,
    /// Transport-level peer address
    pub peer_addr: Option<IpAddr>,
    /// Request path, recorded in audit events only
    pub path: String,
}

impl RequestContext {
    /// An empty context for `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Build a context from an `http` request.
    ///
    /// The identity is read from the request extensions, where the
    /// authentication layer is expected to have stored it.
    pub fn from_request<B>(request: &http::Request<B>, peer: Option<SocketAddr>) -> Self {
        Self {
            identity: request.extensions().get::<Identity>().cloned(),
            headers: request.headers().clone(),
            peer_addr: peer.map(|addr| addr.ip()),
            path: request.uri().path().to_string(),
        }
    }

    /// Set the caller identity.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the transport peer address.
    pub fn with_peer(mut self, peer: IpAddr) -> Self {
        self.peer_addr = Some(peer);
        self
    }

    /// Set the forwarded-address chain. Invalid header values are ignored.
    pub fn with_forwarded_for(mut self, chain: &str) -> Self {
        if let Ok(value) = chain.parse() {
            self.headers.insert(FORWARDED_FOR_HEADER, value);
        }
        self
    }

    /// Role of the caller, if any.
    pub fn role(&self) -> Option<&str> {
        self.identity.as_ref()?.role.as_deref()
    }

    /// Id of the caller, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref()?.id.as_deref()
    }

    /// Best-effort client address.
    ///
    /// First entry of the forwarded chain, then the peer address, then
    /// [`UNKNOWN_ADDRESS`].
    pub fn client_address(&self) -> String {
        let forwarded = self
            .headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty());

        if let Some(first) = forwarded {
            return first.to_string();
        }

        match self.peer_addr {
            Some(peer) => peer.to_string(),
            None => UNKNOWN_ADDRESS.to_string(),
        }
    }

    /// Value of an arbitrary header as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

/// Derives the counter key for a request under a policy prefix.
pub trait KeyGenerator: Send + Sync {
    /// Compute the key for `request` in the `prefix` namespace.
    fn generate(&self, request: &RequestContext, prefix: &str) -> RateLimitKey;
}

impl<F> KeyGenerator for F
where
    F: Fn(&RequestContext, &str) -> RateLimitKey + Send + Sync,
{
    fn generate(&self, request: &RequestContext, prefix: &str) -> RateLimitKey {
        self(request, prefix)
    }
}

/// Prefers the authenticated user id, falls back to the client address.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyGenerator;

impl KeyGenerator for DefaultKeyGenerator {
    fn generate(&self, request: &RequestContext, prefix: &str) -> RateLimitKey {
        match request.user_id() {
            Some(id) => RateLimitKey::user(prefix, id),
            None => RateLimitKey::ip(prefix, &request.client_address()),
        }
    }
}

/// Keys by client address even for authenticated callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressKeyGenerator;

impl KeyGenerator for AddressKeyGenerator {
    fn generate(&self, request: &RequestContext, prefix: &str) -> RateLimitKey {
        RateLimitKey::ip(prefix, &request.client_address())
    }
}

/// Keys by a request header such as a device fingerprint.
///
/// Requests without the header are keyed by [`DefaultKeyGenerator`].
#[derive(Debug, Clone)]
pub struct HeaderKeyGenerator {
    header: String,
}

impl HeaderKeyGenerator {
    /// Key by the value of `header`.
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
        }
    }
}

impl KeyGenerator for HeaderKeyGenerator {
    fn generate(&self, request: &RequestContext, prefix: &str) -> RateLimitKey {
        match request.header(&self.header).map(str::trim) {
            Some(value) if !value.is_empty() => RateLimitKey::new(prefix, "fingerprint", value),
            _ => DefaultKeyGenerator.generate(request, prefix),
        }
    }
}

/// Configurable key strategy, as written in policy files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// User id, else client address
    #[default]
    Identity,
    /// Client address only
    Address,
    /// Named request header, else identity
    Header(String),
    /// A generator supplied in code
    #[serde(skip_deserializing)]
    Custom,
}

impl KeyStrategy {
    /// Build the generator for this strategy.
    pub fn generator(&self) -> Arc<dyn KeyGenerator> {
        match self {
            KeyStrategy::Identity | KeyStrategy::Custom => Arc::new(DefaultKeyGenerator),
            KeyStrategy::Address => Arc::new(AddressKeyGenerator),
            KeyStrategy::Header(name) => Arc::new(HeaderKeyGenerator::new(name.clone())),
        }
    }
}
